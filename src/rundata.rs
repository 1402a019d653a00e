//! Named run data and board operations.

use crate::buffer::BufferLabel;
use crate::channel::Channel;
use crate::mapping::MappingModeControl;
use crate::module::Module;
use crate::{PslError, PslResult};
use std::sync::atomic::Ordering;

/// Version of this library, reported by `get_api_version`.
pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, PartialEq)]
pub enum DataValue {
    Value(f64),
    Flag(bool),
    Words(Vec<u32>),
    Values(Vec<f64>),
    Text(String),
    Samples(Vec<i32>),
}

impl DataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Flag(f) => Some(f64::from(u8::from(*f))),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Value(_) | Self::Flag(_) => 1,
            Self::Words(w) => w.len(),
            Self::Values(v) => v.len(),
            Self::Text(t) => t.len(),
            Self::Samples(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn label(arg: Option<char>) -> PslResult<BufferLabel> {
    BufferLabel::try_from(arg.ok_or(PslError::BadParameters)?)
}

/// Accepted spectrum of the live formatter.
fn spectrum(ch: &Channel) -> PslResult<Vec<u32>> {
    match &ch.mapping {
        MappingModeControl::Mca(mca) => Ok(mca.spectrum()),
        MappingModeControl::FullSpectrum(fs) => match fs.binner() {
            Some(binner) => Ok(binner
                .bins()
                .iter()
                .map(|&b| b.min(u64::from(u32::MAX)) as u32)
                .collect()),
            None => Err(PslError::HistogramNotRunning),
        },
        MappingModeControl::None => Err(PslError::HistogramNotRunning),
    }
}

fn channel_data(ch: &mut Channel, name: &str, arg: Option<char>) -> PslResult<DataValue> {
    use DataValue::*;

    let stats = ch.stats;
    let value = match name {
        "mca" => Words(spectrum(ch)?),
        "mca_length" => Value(spectrum(ch)?.len() as f64),
        "baseline_length" | "sca_length" => Value(0.0),
        "sca" => Values(Vec::new()),
        "runtime" | "realtime" => Value(stats.time_elapsed),
        "trigger_livetime" => Value(stats.trigger_livetime),
        "livetime" => Value(stats.energy_livetime),
        "input_count_rate" => Value(stats.input_count_rate),
        "output_count_rate" => Value(stats.output_count_rate),
        "mca_events" => Value(stats.mca_events),
        "total_output_events" => Value(stats.pulses_accepted),
        "run_active" => Flag(ch.state.is_running()),
        "buffer_len" => Value(ch.mapping.full_spectrum_mut()?.buffer_len() as f64),
        "buffer_done" => {
            ch.mapping.full_spectrum_mut()?.buffer_done(label(arg)?)?;
            Flag(true)
        }
        "buffer_full_a" => Flag(ch.mapping.full_spectrum_mut()?.buffer_full(BufferLabel::A)),
        "buffer_full_b" => Flag(ch.mapping.full_spectrum_mut()?.buffer_full(BufferLabel::B)),
        "buffer_a" => Words(ch.mapping.full_spectrum_mut()?.read_buffer(BufferLabel::A)?),
        "buffer_b" => Words(ch.mapping.full_spectrum_mut()?.read_buffer(BufferLabel::B)?),
        "current_pixel" => Value(f64::from(ch.mapping.full_spectrum_mut()?.current_pixel())),
        "buffer_overrun" => Value(f64::from(ch.mapping.full_spectrum_mut()?.pair().overruns())),
        "list_buffer_len_a" => Value(ch.mapping.full_spectrum_mut()?.pair().buffer(BufferLabel::A).level() as f64),
        "list_buffer_len_b" => Value(ch.mapping.full_spectrum_mut()?.pair().buffer(BufferLabel::B).level() as f64),
        _ => return Err(PslError::UnknownValue),
    };
    Ok(value)
}

impl Module {
    /// Reads named run data for one channel. `arg` carries the buffer label
    /// for `buffer_done`.
    pub fn get_run_data(&self, channel: usize, name: &str, arg: Option<char>) -> PslResult<DataValue> {
        match name {
            "module_statistics_2" => {
                let channels = self.shared.channels();
                let values = channels
                    .iter()
                    .flat_map(|c| c.stats.module_statistics())
                    .collect();
                Ok(DataValue::Values(values))
            }
            "module_mca" => {
                let channels = self.shared.channels();
                let mut words = Vec::new();
                for c in channels.iter() {
                    words.extend(spectrum(c)?);
                }
                Ok(DataValue::Words(words))
            }
            _ => self.with_channel(channel, |c| channel_data(c, name, arg))?,
        }
    }

    /// Runs a named board operation.
    pub fn board_operation(&self, name: &str, arg: Option<char>) -> PslResult<DataValue> {
        use DataValue::*;

        let info = self.card_info();
        let value = match name {
            "apply" => {
                for channel in 0..self.num_channels() {
                    self.push_acquisition_values(channel)?;
                }
                Flag(true)
            }
            "buffer_done" => {
                let label = label(arg)?;
                let mut channels = self.shared.channels();
                for c in channels.iter_mut().filter(|c| c.mapping.is_mapping()) {
                    c.mapping.full_spectrum_mut()?.buffer_done(label)?;
                }
                Flag(true)
            }
            "get_api_version" => Text(API_VERSION.to_string()),
            "get_build_date" => Text(info.text("instrument.buildDate")),
            "get_bootloader_ver" => Text(info.text("instrument.bootloaderVersion")),
            "get_card_name" => Text(info.text("instrument.productName")),
            "get_card_channels" => Value(self.num_channels() as f64),
            "get_serial_number" => Text(info.text("instrument.serialNumber")),
            "get_fpga_version" => Text(info.text("instrument.fpgaVersion")),
            "get_app_id" => Text(info.text("instrument.appId")),
            "get_fpga_id" => Text(info.text("instrument.fpgaId")),
            "get_fpga_running" => Flag(
                info.get("instrument.fpgaRunning")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            ),
            "get_connected" => Flag(self.shared.connected.load(Ordering::SeqCst)),
            _ => return Err(PslError::UnknownValue),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Transition;
    use crate::codec::Histogram;
    use crate::mapping::FullSpectrumConfig;
    use crate::stats::PixelStats;

    fn mapping_channel() -> Channel {
        let mut ch = Channel::new(0);
        ch.apply(Transition::Open).unwrap();
        ch.mapping = MappingModeControl::open_full_spectrum(FullSpectrumConfig {
            detector_channel: 0,
            run_number: 1,
            mca_channels: 1024,
            pixels_per_buffer: 1,
            num_pixels: 0,
            list_mode: false,
            sample_rate: crate::binner::DEFAULT_SAMPLE_RATE,
        })
        .unwrap();
        ch
    }

    #[test]
    fn buffer_cycle_through_run_data() {
        let mut ch = mapping_channel();
        assert_eq!(
            channel_data(&mut ch, "buffer_full_a", None).unwrap(),
            DataValue::Flag(false)
        );
        ch.mapping
            .full_spectrum_mut()
            .unwrap()
            .write_pixel(&PixelStats::default(), &[1; 16])
            .unwrap();
        assert_eq!(
            channel_data(&mut ch, "buffer_full_a", None).unwrap(),
            DataValue::Flag(true)
        );
        assert_eq!(
            channel_data(&mut ch, "current_pixel", None).unwrap(),
            DataValue::Value(1.0)
        );
        let DataValue::Words(words) = channel_data(&mut ch, "buffer_a", None).unwrap() else {
            panic!("buffer_a is not words");
        };
        assert_eq!(words[0] & 0xffff, 0x55aa);
        assert_eq!(
            channel_data(&mut ch, "buffer_done", None).unwrap_err(),
            PslError::BadParameters
        );
        channel_data(&mut ch, "buffer_done", Some('a')).unwrap();
        assert_eq!(
            channel_data(&mut ch, "buffer_overrun", None).unwrap(),
            DataValue::Value(0.0)
        );
    }

    #[test]
    fn overrun_count_survives_reads() {
        let mut ch = mapping_channel();
        let fs = ch.mapping.full_spectrum_mut().unwrap();
        for _ in 0..2 {
            fs.write_pixel(&PixelStats::default(), &[1; 16]).unwrap();
        }
        assert_eq!(
            fs.write_pixel(&PixelStats::default(), &[1; 16]).unwrap_err(),
            PslError::InternalBufferOverrun
        );
        for _ in 0..2 {
            assert_eq!(
                channel_data(&mut ch, "buffer_overrun", None).unwrap(),
                DataValue::Value(1.0)
            );
        }
    }

    #[test]
    fn mca_reads_need_a_run() {
        let mut ch = Channel::new(0);
        assert_eq!(
            channel_data(&mut ch, "mca", None).unwrap_err(),
            PslError::HistogramNotRunning
        );
        assert_eq!(
            channel_data(&mut ch, "baseline_length", None).unwrap(),
            DataValue::Value(0.0)
        );
        ch.mapping = MappingModeControl::open_mca(1024).unwrap();
        ch.mapping
            .update_histogram(&Histogram {
                accepted: vec![5; 1024],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            channel_data(&mut ch, "mca_length", None).unwrap(),
            DataValue::Value(1024.0)
        );
        assert_eq!(
            channel_data(&mut ch, "buffer_len", None).unwrap_err(),
            PslError::InvalidValue
        );
        assert_eq!(
            channel_data(&mut ch, "no_such_data", None).unwrap_err(),
            PslError::UnknownValue
        );
    }
}
