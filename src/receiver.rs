//! The per-module receiver thread.

use crate::channel::{AsyncEvent, Channel, Transition};
use crate::codec::Response;
use crate::correlator::lock;
use crate::module::{Shared, RECEIVER_POLL_MS};
use crate::registry;
use crate::transport::FrameReader;
use crate::PslError;
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(crate) fn run(shared: Arc<Shared>, mut reader: Box<dyn FrameReader>) {
    debug!("{}: receiver started", shared.options.alias);
    while !shared.shutdown.load(Ordering::SeqCst) {
        let body = match reader.poll_ready(RECEIVER_POLL_MS) {
            Ok(false) => continue,
            Ok(true) => reader.read_frame(),
            Err(err) => Err(err),
        };
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                if !shared.shutdown.load(Ordering::SeqCst) {
                    shared.disconnect(err);
                }
                break;
            }
        };
        lock(&shared.traffic).increment(body.len());
        match Response::decode(&body) {
            Ok(response) => dispatch(&shared, response),
            Err(err) => warn!("undecodable {} byte frame: {}", body.len(), err),
        }
    }
    debug!("{}: receiver stopped", shared.options.alias);
}

/// Hands a response to the waiting caller, or applies it to channel state.
pub(crate) fn dispatch(shared: &Shared, response: Response) {
    let Some(message) = shared.correlator.offer(response) else {
        return;
    };
    if let Response::AsynchronousError { channel, error } = &message {
        let err = error.to_error();
        warn!(
            "{}: channel {} reported {}: {}",
            shared.options.alias, channel, err, error.message
        );
        let target = (*channel >= 0).then_some(*channel);
        if shared.correlator.fail_channel(target, err) {
            return;
        }
    }
    if let Response::SoftwareUpdateComplete { error } = &message {
        match error {
            Some(e) if e.code != 0 => warn!("software update failed: {}", e.message),
            _ => info!("{}: software update complete", shared.options.alias),
        }
        return;
    }

    let Some(channel) = message.channel() else {
        return;
    };
    let mut channels = shared.channels();
    let targets: Vec<usize> = if channel < 0 {
        (0..channels.len()).collect()
    } else if (channel as usize) < channels.len() {
        vec![channel as usize]
    } else {
        warn!("{:?} for unknown channel {}", message.message_type(), channel);
        return;
    };
    for index in targets {
        apply(&mut channels[index], &message);
    }
    shared.channel_event.notify_all();
}

fn apply(ch: &mut Channel, message: &Response) {
    match message {
        Response::AsynchronousError { error, .. } => {
            ch.apply_or_warn(Transition::AsyncError);
            ch.latch.fail(error.to_error());
            ch.last_error = Some(error.clone());
        }
        Response::ParamUpdated { params, .. } => {
            for kv in params {
                let refreshed = registry::apply_param_update(&mut ch.values, kv);
                debug!("channel {}: card set {} {:?}", ch.index, kv.key, refreshed);
                ch.params.insert(kv.key.clone(), kv.value.clone());
            }
            ch.latch.fire(AsyncEvent::ParamUpdate, Ok(()));
        }
        Response::CalibrationProgress {
            progress,
            complete,
            stage,
            error,
            ..
        } => calibration_progress(ch, *progress, *complete, stage, error.as_ref()),
        Response::HistogramData(histogram) | Response::HistogramDatagram(histogram) => {
            match ch.mapping.update_histogram(histogram) {
                Ok(Some(stats)) => {
                    ch.stats = stats;
                    ch.histograms += 1;
                }
                Ok(None) => debug!("channel {}: histogram with no run open", ch.index),
                Err(err) => warn!("channel {}: histogram dropped: {}", ch.index, err),
            }
        }
        Response::OscilloscopeData { samples, .. } => {
            ch.adc_trace.clone_from(samples);
            ch.apply_or_warn(Transition::OscilloscopeData);
            ch.latch.fire(AsyncEvent::Oscilloscope, Ok(()));
        }
        Response::ListModeData { data, .. } => match ch.mapping.feed_list_mode(data) {
            Ok(pixels) => {
                if let Some(fs) = ch.mapping.full_spectrum() {
                    ch.stats = *fs.stats();
                }
                if pixels > 0 {
                    debug!("channel {}: {} list-mode pixels", ch.index, pixels);
                }
            }
            Err(err) => warn!(
                "channel {}: {} list-mode bytes dropped: {}",
                ch.index,
                data.len(),
                err
            ),
        },
        other => debug!("ignoring {:?}", other.message_type()),
    }
}

fn calibration_progress(
    ch: &mut Channel,
    progress: f64,
    complete: bool,
    stage: &str,
    error: Option<&crate::codec::ErrorInfo>,
) {
    let failed = error.filter(|e| e.code != 0);
    let c = &mut ch.characterization;
    c.progress = (progress * 100.0).clamp(0.0, 100.0);
    c.set_stage(stage);
    if let Some(e) = failed {
        warn!("channel {}: characterization failed: {}", ch.index, e.message);
        c.running = false;
        c.successful = false;
        ch.apply_or_warn(Transition::CalibrationComplete);
        ch.latch.fire(AsyncEvent::Calibration, Err(e.to_error()));
        return;
    }
    if !complete {
        c.running = true;
        return;
    }
    info!("channel {}: characterization complete", ch.index);
    c.running = false;
    c.successful = true;
    ch.fetch_calibration = true;
    ch.calibration = crate::channel::CalibrationState::NeedRefresh;
    ch.apply_or_warn(Transition::CalibrationComplete);
    ch.latch.fire(AsyncEvent::Calibration, Ok(()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ErrorInfo, Histogram, KeyValue, ParamValue};
    use crate::mapping::MappingModeControl;

    fn ready_channel() -> Channel {
        let mut ch = Channel::new(0);
        ch.apply(Transition::Open).unwrap();
        ch
    }

    #[test]
    fn oscilloscope_data_fires_latch() {
        let mut ch = ready_channel();
        ch.apply(Transition::StartOscilloscope).unwrap();
        ch.latch.arm(AsyncEvent::Oscilloscope);
        apply(
            &mut ch,
            &Response::OscilloscopeData {
                channel: 0,
                samples: vec![1, -2, 3],
            },
        );
        assert_eq!(ch.adc_trace, vec![1, -2, 3]);
        assert_eq!(ch.state, crate::channel::ChannelState::Ready);
        assert_eq!(ch.latch.take(), Some(Ok(())));
    }

    #[test]
    fn calibration_completion_requests_fetch() {
        let mut ch = ready_channel();
        ch.apply(Transition::StartCalibration).unwrap();
        apply(
            &mut ch,
            &Response::CalibrationProgress {
                channel: 0,
                progress: 0.5,
                complete: false,
                stage: "measuring".into(),
                error: None,
            },
        );
        assert!(ch.characterization.running);
        assert_eq!(ch.characterization.progress, 50.0);
        apply(
            &mut ch,
            &Response::CalibrationProgress {
                channel: 0,
                progress: 1.0,
                complete: true,
                stage: "done".into(),
                error: None,
            },
        );
        assert!(ch.fetch_calibration);
        assert!(ch.characterization.successful);
        assert_eq!(ch.state, crate::channel::ChannelState::Ready);
    }

    #[test]
    fn async_error_moves_channel_to_error() {
        let mut ch = ready_channel();
        apply(
            &mut ch,
            &Response::AsynchronousError {
                channel: 0,
                error: ErrorInfo::new(PslError::FpgaFailure, "fpga"),
            },
        );
        assert_eq!(ch.state, crate::channel::ChannelState::Error);
        assert_eq!(ch.last_error.as_ref().unwrap().to_error(), PslError::FpgaFailure);
    }

    #[test]
    fn histogram_updates_mca_and_stats() {
        let mut ch = ready_channel();
        ch.mapping = MappingModeControl::open_mca(1024).unwrap();
        apply(
            &mut ch,
            &Response::HistogramData(Histogram {
                accepted: vec![1, 2, 3, 4],
                ..Default::default()
            }),
        );
        assert_eq!(ch.stats.mca_events, 10.0);
        assert_eq!(ch.histograms, 1);
        assert_eq!(&ch.mapping.mca().unwrap().spectrum()[..5], &[1, 2, 3, 4, 0]);
    }

    #[test]
    fn param_updates_are_cached() {
        let mut ch = ready_channel();
        apply(
            &mut ch,
            &Response::ParamUpdated {
                channel: 0,
                params: vec![KeyValue::new("afe.offset", ParamValue::Float(0.25))],
            },
        );
        assert_eq!(ch.params["afe.offset"], ParamValue::Float(0.25));
        assert_eq!(ch.value("analog_offset"), Some(0.25));
    }
}
