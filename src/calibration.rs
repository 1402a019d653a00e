//! Detector characterization, firmware-set files and the single-shot
//! special runs.

use crate::channel::{AsyncEvent, CalibrationState, ChannelState, Transition};
use crate::codec::{CalibrationInfo, CalibrationPlot, Request, Response};
use crate::module::{CharacterizationStatus, Module};
use crate::{PslError, PslResult};
use log::{debug, error, info, warn};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Upper bound on the scratch space used to copy out one plot axis.
pub const MAX_PLOT_BYTES: usize = 1 << 20;
const INITIAL_PLOT_POINTS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlotKind {
    Example,
    Model,
    Final,
}

impl PlotKind {
    fn select(self, info: &crate::channel::Characterization) -> &CalibrationPlot {
        match self {
            Self::Example => &info.example,
            Self::Model => &info.model,
            Self::Final => &info.final_,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

fn io_error(path: &Path, err: io::Error) -> PslError {
    error!("{}: {}", path.display(), err);
    match err.kind() {
        io::ErrorKind::NotFound => PslError::NotFound,
        io::ErrorKind::PermissionDenied => PslError::AuthorizationFailed,
        _ => PslError::OutOfResources,
    }
}

/// Copies `source` into a scratch vector that grows by doubling.
fn copy_scaled(source: &[f64]) -> PslResult<Vec<f64>> {
    let max_points = MAX_PLOT_BYTES / std::mem::size_of::<f64>();
    let mut capacity = INITIAL_PLOT_POINTS;
    while capacity < source.len() {
        capacity *= 2;
        if capacity > max_points {
            return Err(PslError::TooBig);
        }
    }
    let mut scratch = Vec::with_capacity(capacity);
    scratch.extend_from_slice(source);
    Ok(scratch)
}

/// Writes `blob` over `path` through a temporary file in the same directory.
pub fn write_calibration_file(path: &Path, blob: &str) -> PslResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut file = NamedTempFile::new_in(&dir).map_err(|e| io_error(&dir, e))?;
    file.write_all(blob.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| io_error(path, e))?;
    file.persist(path).map_err(|e| io_error(path, e.error))?;
    Ok(())
}

fn parent_exists(path: &Path) -> bool {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.is_dir(),
        _ => true,
    }
}

impl Module {
    fn firmware_file(&self, channel: usize) -> PslResult<PathBuf> {
        self.options()
            .firmware_sets
            .get(channel)
            .and_then(|fs| fs.as_ref())
            .map(|fs| fs.filename.clone())
            .ok_or(PslError::NotFound)
    }

    /// Starts the multi-stage pulse characterization on one channel.
    pub fn start_characterization(&self, channel: usize) -> PslResult<()> {
        let path = self.firmware_file(channel)?;
        if !parent_exists(&path) {
            warn!("channel {}: no directory for {}", channel, path.display());
            return Err(PslError::NotFound);
        }
        self.with_channel(channel, |c| -> PslResult<()> {
            c.apply(Transition::StartCalibration)?;
            c.characterization.running = true;
            c.characterization.successful = false;
            c.characterization.progress = 0.0;
            c.characterization.set_stage("");
            c.latch.arm(AsyncEvent::Calibration);
            Ok(())
        })??;
        let result = self.call(Request::StartCalibration {
            channel: channel as i32,
        });
        if let Err(err) = result {
            self.with_channel(channel, |c| {
                c.apply_or_warn(Transition::Stop);
                c.characterization.running = false;
            })?;
            return Err(err);
        }
        info!("channel {}: characterization started", channel);
        Ok(())
    }

    pub fn cancel_characterization(&self, channel: usize) -> PslResult<()> {
        if self.channel_state(channel)? != ChannelState::Characterizing {
            return Err(PslError::CalibrationNotRunning);
        }
        self.call(Request::Stop {
            channel: channel as i32,
        })?;
        self.with_channel(channel, |c| {
            c.apply_or_warn(Transition::Stop);
            c.characterization.running = false;
            c.latch.fail(PslError::CalibrationNotRunning);
        })?;
        info!("channel {}: characterization cancelled", channel);
        Ok(())
    }

    /// Reports progress, fetching the results once the card has finished.
    pub fn poll_characterization(&self, channel: usize) -> PslResult<CharacterizationStatus> {
        if self.with_channel(channel, |c| c.fetch_calibration)? {
            self.fetch_calibration(channel)?;
        }
        self.with_channel(channel, |c| CharacterizationStatus {
            running: c.characterization.running,
            successful: c.characterization.successful,
            progress: c.characterization.progress,
            stage: c.characterization.stage.clone(),
        })
    }

    /// Blocks until the characterization ends, then polls once.
    pub fn wait_characterization(&self, channel: usize) -> PslResult<CharacterizationStatus> {
        self.wait_latch(channel, self.options().characterization_timeout)?;
        self.poll_characterization(channel)
    }

    fn fetch_calibration(&self, channel: usize) -> PslResult<()> {
        let info = match self.call(Request::GetCalibration {
            channel: channel as i32,
        })?
        .pop()
        {
            Some(Response::GetCalibrationResponse { calibration, .. }) => calibration,
            _ => return Err(PslError::InvalidRequest),
        };
        debug!(
            "channel {}: calibration blob of {} bytes, plots {}/{}/{}",
            channel,
            info.data.len(),
            info.example.len(),
            info.model.len(),
            info.final_.len()
        );
        let blob = info.data.clone();
        self.with_channel(channel, |c| {
            let ch = &mut c.characterization;
            ch.blob = Some(info.data);
            ch.example = info.example;
            ch.model = info.model;
            ch.final_ = info.final_;
            c.calibration = CalibrationState::Ready;
            c.fetch_calibration = false;
        })?;
        if let Ok(path) = self.firmware_file(channel) {
            write_calibration_file(&path, &blob)?;
            info!("channel {}: calibration saved to {}", channel, path.display());
        }
        Ok(())
    }

    pub fn characterization_blob(&self, channel: usize) -> PslResult<String> {
        self.with_channel(channel, |c| c.characterization.blob.clone())?
            .ok_or(PslError::NoCalibrationData)
    }

    /// One axis of a characterization plot.
    pub fn characterization_plot(&self, channel: usize, kind: PlotKind, axis: Axis) -> PslResult<Vec<f64>> {
        self.with_channel(channel, |c| {
            let plot = kind.select(&c.characterization);
            match axis {
                Axis::X => copy_scaled(&plot.x),
                Axis::Y => copy_scaled(&plot.y),
            }
        })?
    }

    /// Writes the current blob back to the channel's firmware file.
    pub fn save_calibration_file(&self, channel: usize) -> PslResult<()> {
        let path = self.firmware_file(channel)?;
        let blob = self.characterization_blob(channel)?;
        write_calibration_file(&path, &blob)
    }

    /// Pushes each channel's stored characterization to the card.
    pub(crate) fn load_calibration_files(&self) -> PslResult<()> {
        for channel in 0..self.num_channels() {
            let Ok(path) = self.firmware_file(channel) else {
                continue;
            };
            let blob = match fs::read_to_string(&path) {
                Ok(blob) => blob,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("channel {}: {} not present yet", channel, path.display());
                    continue;
                }
                Err(err) => return Err(io_error(&path, err)),
            };
            if blob.trim().is_empty() {
                continue;
            }
            self.call(Request::SetCalibration {
                channel: channel as i32,
                calibration: CalibrationInfo {
                    data: blob.clone(),
                    ..Default::default()
                },
            })?;
            self.with_channel(channel, |c| {
                c.characterization.blob = Some(blob);
                c.calibration = CalibrationState::Ready;
            })?;
            info!("channel {}: calibration loaded from {}", channel, path.display());
        }
        Ok(())
    }

    /// Captures one oscilloscope trace and returns the channel to Ready.
    pub fn adc_trace(&self, channel: usize) -> PslResult<Vec<i32>> {
        self.with_channel(channel, |c| -> PslResult<()> {
            c.apply(Transition::StartOscilloscope)?;
            c.latch.arm(AsyncEvent::Oscilloscope);
            Ok(())
        })??;
        let result = self
            .call(Request::StartOscilloscope {
                channel: channel as i32,
            })
            .and_then(|_| self.wait_latch(channel, self.options().adc_trace_timeout));
        if let Err(err) = result {
            self.with_channel(channel, |c| {
                if c.state == ChannelState::Adc {
                    c.apply_or_warn(Transition::Stop);
                }
            })?;
            return Err(err);
        }
        self.with_channel(channel, |c| c.adc_trace.clone())
    }

    /// Runs a named single-shot operation.
    pub fn special_run(&self, channel: usize, name: &str) -> PslResult<()> {
        match name {
            "adc_trace" => self.adc_trace(channel).map(|_| ()),
            "detc-start" => self.start_characterization(channel),
            "detc-stop" => self.cancel_characterization(channel),
            _ => Err(PslError::UnknownValue),
        }
    }

    /// Results of the special runs, by name.
    pub fn special_run_data(&self, channel: usize, name: &str) -> PslResult<crate::rundata::DataValue> {
        use crate::rundata::DataValue;

        if let Some(rest) = name.strip_prefix("get-detc-") {
            let (rest, length) = match rest.strip_suffix("-length") {
                Some(rest) => (rest, true),
                None => (rest, false),
            };
            let (kind, axis) = match rest {
                "example-x" => (PlotKind::Example, Axis::X),
                "example-y" => (PlotKind::Example, Axis::Y),
                "model-x" => (PlotKind::Model, Axis::X),
                "model-y" => (PlotKind::Model, Axis::Y),
                "final-x" => (PlotKind::Final, Axis::X),
                "final-y" => (PlotKind::Final, Axis::Y),
                _ => return Err(PslError::UnknownValue),
            };
            let values = self.characterization_plot(channel, kind, axis)?;
            return Ok(if length {
                DataValue::Value(values.len() as f64)
            } else {
                DataValue::Values(values)
            });
        }
        match name {
            "adc_trace_length" => self.with_channel(channel, |c| DataValue::Value(c.adc_trace.len() as f64)),
            "get_adc_trace" => self.with_channel(channel, |c| DataValue::Samples(c.adc_trace.clone())),
            "detc-running" => Ok(DataValue::Flag(self.poll_characterization(channel)?.running)),
            "detc-successful" => Ok(DataValue::Flag(self.poll_characterization(channel)?.successful)),
            "detc-progress" => Ok(DataValue::Value(self.poll_characterization(channel)?.progress)),
            "detc-progress-text" => Ok(DataValue::Text(self.poll_characterization(channel)?.stage)),
            _ => Err(PslError::UnknownValue),
        }
    }
}
