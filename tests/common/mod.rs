//! A scripted card on the far end of a loopback connection.

#![allow(dead_code)]

use falconx::codec::{
    CalibrationInfo, CalibrationPlot, KeyValue, ParamValue, Request, Response, ALL_CHANNELS,
};
use falconx::transport::{loopback, FrameReader, FrameWriter, LoopbackWriter};
use falconx::{FirmwareSet, Module, ModuleOptions};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type Params = Arc<Mutex<HashMap<(i32, String), ParamValue>>>;

/// Answers a request itself, or returns `None` for the stock answer.
pub type Script = Box<dyn FnMut(&Request) -> Option<Vec<Response>> + Send>;

pub const CALIBRATION_BLOB: &str = "c2FtcGxlIGNhbGlicmF0aW9u";

pub fn options(channels: usize) -> ModuleOptions {
    ModuleOptions {
        alias: "test".to_string(),
        channels,
        response_timeout: Duration::from_millis(500),
        adc_trace_timeout: Duration::from_secs(2),
        state_change_timeout: Duration::from_secs(2),
        characterization_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
        firmware_sets: Vec::new(),
    }
}

pub fn with_firmware(mut options: ModuleOptions, path: PathBuf) -> ModuleOptions {
    options.firmware_sets = vec![Some(FirmwareSet {
        alias: "fs0".to_string(),
        filename: path,
    })];
    options
}

pub fn success(channel: i32) -> Response {
    Response::Success {
        channel,
        error: None,
    }
}

pub fn sample_calibration() -> CalibrationInfo {
    let plot = |n: usize| CalibrationPlot {
        x: (0..n).map(|i| i as f64).collect(),
        y: (0..n).map(|i| (i * i) as f64).collect(),
    };
    CalibrationInfo {
        data: CALIBRATION_BLOB.to_string(),
        example: plot(3),
        model: plot(5),
        final_: plot(7),
    }
}

pub struct Card {
    pusher: LoopbackWriter,
    requests: Arc<Mutex<Vec<Request>>>,
    pub params: Params,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Card {
    /// Sends an unsolicited message to the host.
    pub fn push(&self, response: Response) {
        let mut writer = self.pusher.clone();
        writer.send(&response.encode()).unwrap();
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    pub fn set(&self, channel: i32, key: &str, value: ParamValue) {
        self.params
            .lock()
            .unwrap()
            .insert((channel, key.to_string()), value);
    }

    pub fn get(&self, channel: i32, key: &str) -> Option<ParamValue> {
        self.params
            .lock()
            .unwrap()
            .get(&(channel, key.to_string()))
            .cloned()
    }

    /// Closes the card's end of the connection.
    pub fn hang_up(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            handle.join().unwrap();
        }
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn targets(channel: i32, channels: usize) -> Vec<i32> {
    if channel == ALL_CHANNELS {
        (0..channels as i32).collect()
    } else {
        vec![channel]
    }
}

fn store(params: &Params, channel: i32, kv: &KeyValue, channels: usize) {
    let mut params = params.lock().unwrap();
    for ch in targets(channel, channels) {
        params.insert((ch, kv.key.clone()), kv.value.clone());
    }
}

fn lookup(params: &Params, channel: i32, keys: &[String]) -> Vec<KeyValue> {
    let params = params.lock().unwrap();
    keys.iter()
        .map(|key| {
            let value = params
                .get(&(channel, key.clone()))
                .cloned()
                .unwrap_or(ParamValue::Float(0.0));
            KeyValue::new(key.clone(), value)
        })
        .collect()
}

/// What a well-behaved card answers.
pub fn stock_answer(request: &Request, params: &Params, channels: usize) -> Vec<Response> {
    let per_channel = |channel: i32| -> Vec<Response> {
        targets(channel, channels).into_iter().map(success).collect()
    };
    match request {
        Request::SetParam { channel, param } => {
            store(params, *channel, param, channels);
            per_channel(*channel)
        }
        Request::SetParams {
            channel,
            params: values,
        } => {
            for kv in values {
                store(params, *channel, kv, channels);
            }
            per_channel(*channel)
        }
        Request::StartOscilloscope { channel }
        | Request::StartHistogram { channel }
        | Request::StartFft { channel }
        | Request::StartListMode { channel }
        | Request::StartCalibration { channel }
        | Request::Stop { channel }
        | Request::SetCalibration { channel, .. } => per_channel(*channel),
        Request::GetParam { channel, key } => vec![Response::GetParamResponse {
            channel: *channel,
            results: lookup(params, *channel, std::slice::from_ref(key)),
            error: None,
        }],
        Request::GetParams { channel, keys } => vec![Response::GetParamResponse {
            channel: *channel,
            results: lookup(params, *channel, keys),
            error: None,
        }],
        Request::ListParamDetails { channel, .. } => vec![Response::ListParamDetailsResponse {
            channel: *channel,
            details: Vec::new(),
            error: None,
        }],
        Request::CheckParamConsistency { channel } => {
            vec![Response::CheckParamConsistencyResponse {
                channel: *channel,
                consistent: true,
                message: String::new(),
                error: None,
            }]
        }
        Request::GetCalibration { channel } => vec![Response::GetCalibrationResponse {
            channel: *channel,
            calibration: sample_calibration(),
            error: None,
        }],
        Request::CalculateDcOffset { channel } => vec![Response::CalculateDcOffsetResponse {
            channel: *channel,
            offset: 0.125,
            error: None,
        }],
        _ => vec![success(0)],
    }
}

/// Opens a module against a scripted card with `channels` channels.
pub fn start(options: ModuleOptions, script: Script) -> (Module, Card) {
    let channels = options.channels;
    let (host, card_end) = loopback();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let params: Params = Arc::new(Mutex::new(HashMap::new()));
    let stop = Arc::new(AtomicBool::new(false));

    let thread = {
        let requests = Arc::clone(&requests);
        let params = Arc::clone(&params);
        let stop = Arc::clone(&stop);
        let mut reader = card_end.reader;
        let mut writer = card_end.writer.clone();
        let mut script = script;
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match reader.poll_ready(20) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(_) => break,
                }
                let Ok(body) = reader.read_frame() else {
                    break;
                };
                let request = Request::decode(&body).unwrap();
                requests.lock().unwrap().push(request.clone());
                let responses = script(&request)
                    .unwrap_or_else(|| stock_answer(&request, &params, channels));
                for response in responses {
                    if writer.send(&response.encode()).is_err() {
                        return;
                    }
                }
            }
        })
    };

    let card = Card {
        pusher: card_end.writer,
        requests,
        params,
        stop,
        thread: Some(thread),
    };
    let module = Module::open_with(Box::new(host.reader), Box::new(host.writer), options).unwrap();
    (module, card)
}

/// A card that answers every request the stock way.
pub fn start_plain(channels: usize) -> (Module, Card) {
    start(options(channels), Box::new(|_| None))
}

/// Polls `done` for up to two seconds.
pub fn eventually(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}
