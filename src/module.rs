//! One FalconX card: the connection, its receiver thread and its channels.

use crate::card_params::{read_card_info, CardInfo};
use crate::channel::{AsyncEvent, Channel, ChannelFeatures, ChannelState, Transition, MAX_CHANNELS};
use crate::codec::{KeyValue, ParamDetails, ParamValue, Request, Response, ALL_CHANNELS};
use crate::correlator::{lock, Correlator};
use crate::mapping::{FullSpectrumConfig, MappingMode, MappingModeControl};
use crate::receiver;
use crate::registry;
use crate::transport::{connect, FrameReader, FrameWriter};
use crate::utils::Counter;
use crate::{PslError, PslResult};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long the receiver waits for a frame before checking for shutdown.
pub(crate) const RECEIVER_POLL_MS: i32 = 100;

/// A detector-characterization file bound to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSet {
    pub alias: String,
    pub filename: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ModuleOptions {
    pub alias: String,
    pub channels: usize,
    pub response_timeout: Duration,
    pub adc_trace_timeout: Duration,
    pub state_change_timeout: Duration,
    pub characterization_timeout: Duration,
    pub connect_timeout: Duration,
    /// Per channel; `None` leaves the channel unbound.
    pub firmware_sets: Vec<Option<FirmwareSet>>,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            alias: "module".to_string(),
            channels: 1,
            response_timeout: Duration::from_millis(2000),
            adc_trace_timeout: Duration::from_millis(10_000),
            state_change_timeout: Duration::from_millis(5000),
            characterization_timeout: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(5000),
            firmware_sets: Vec::new(),
        }
    }
}

/// State shared between callers and the receiver thread.
pub(crate) struct Shared {
    pub(crate) options: ModuleOptions,
    pub(crate) writer: Mutex<Box<dyn FrameWriter>>,
    pub(crate) correlator: Correlator,
    pub(crate) channels: Mutex<Vec<Channel>>,
    pub(crate) channel_event: Condvar,
    pub(crate) card: Mutex<CardInfo>,
    pub(crate) traffic: Mutex<Counter>,
    pub(crate) run_number: AtomicU32,
    pub(crate) connected: AtomicBool,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn channels(&self) -> MutexGuard<'_, Vec<Channel>> {
        lock(&self.channels)
    }

    /// Tears the module down after a transport failure.
    pub(crate) fn disconnect(&self, err: PslError) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        error!("{}: connection lost: {}", self.options.alias, err);
        self.correlator.abort(err);
        let mut channels = self.channels();
        for ch in channels.iter_mut() {
            ch.apply_or_warn(Transition::AsyncError);
            ch.latch.fail(err);
        }
        self.channel_event.notify_all();
    }
}

/// Current state of a characterization.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterizationStatus {
    pub running: bool,
    pub successful: bool,
    pub progress: f64,
    pub stage: String,
}

pub struct Module {
    pub(crate) shared: Arc<Shared>,
    receiver: Option<JoinHandle<()>>,
}

impl Module {
    /// Connects to a card over TCP and reads its configuration.
    pub fn open(host: &str, port: u16, options: ModuleOptions) -> PslResult<Self> {
        info!("{}: connecting to {}:{}", options.alias, host, port);
        let (reader, writer) = connect(host, port, options.connect_timeout)?;
        let module = Self::open_with(Box::new(reader), Box::new(writer), options)?;
        module.initialize()?;
        Ok(module)
    }

    /// Starts a module over an already established connection.
    pub fn open_with(
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        options: ModuleOptions,
    ) -> PslResult<Self> {
        if options.channels == 0 || options.channels > MAX_CHANNELS {
            return Err(PslError::BadChannel);
        }
        let mut channels = Vec::with_capacity(options.channels);
        for index in 0..options.channels {
            let mut ch = Channel::new(index);
            ch.apply(Transition::Open)?;
            ch.firmware_set = options
                .firmware_sets
                .get(index)
                .and_then(|fs| fs.as_ref().map(|fs| fs.alias.clone()));
            registry::seed_defaults(&mut ch.values);
            channels.push(ch);
        }
        let alias = options.alias.clone();
        let shared = Arc::new(Shared {
            options,
            writer: Mutex::new(writer),
            correlator: Correlator::new(),
            channels: Mutex::new(channels),
            channel_event: Condvar::new(),
            card: Mutex::new(CardInfo::default()),
            traffic: Mutex::new(Counter::new()),
            run_number: AtomicU32::new(0),
            connected: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
        });
        let receiver = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("{}-rx", alias))
                .spawn(move || receiver::run(shared, reader))
                .map_err(|e| {
                    error!("cannot start receiver thread: {}", e);
                    PslError::OutOfResources
                })?
        };
        debug!("{}: module open", alias);
        Ok(Self {
            shared,
            receiver: Some(receiver),
        })
    }

    /// Reads the card description and channel features, then pushes any
    /// stored characterization from the bound firmware files.
    pub fn initialize(&self) -> PslResult<()> {
        let info = read_card_info(self)?;
        info.log_all(&self.shared.options.alias);
        *lock(&self.shared.card) = info;

        for ch in 0..self.num_channels() {
            let keys: Vec<String> = ChannelFeatures::KEYS.iter().map(|k| k.to_string()).collect();
            let params = self.get_params(ch as i32, &keys)?;
            let features = ChannelFeatures::from_params(&params);
            debug!("channel {} features: {:?}", ch, features);
            self.with_channel(ch, |c| c.features = features)?;
        }
        self.load_calibration_files()
    }

    pub fn alias(&self) -> &str {
        &self.shared.options.alias
    }

    pub fn options(&self) -> &ModuleOptions {
        &self.shared.options
    }

    pub fn num_channels(&self) -> usize {
        self.shared.options.channels
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn run_number(&self) -> u32 {
        self.shared.run_number.load(Ordering::SeqCst)
    }

    pub fn card_info(&self) -> CardInfo {
        lock(&self.shared.card).clone()
    }

    /// Frame traffic seen by the receiver: (MB/s over the last second, frames).
    pub fn traffic(&self) -> (f64, usize) {
        let counter = lock(&self.shared.traffic);
        (counter.rate(), counter.frames)
    }

    /// True when no request is waiting for a response.
    pub fn is_idle(&self) -> bool {
        self.shared.correlator.is_idle()
    }

    pub fn close(&mut self) {
        let Some(handle) = self.receiver.take() else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::SeqCst);
        lock(&self.shared.writer).shutdown();
        if handle.join().is_err() {
            warn!("{}: receiver thread panicked", self.alias());
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        for ch in self.shared.channels().iter_mut() {
            ch.apply_or_warn(Transition::Close);
        }
        info!("{}: closed", self.alias());
    }

    pub(crate) fn check_channel(&self, channel: usize) -> PslResult<()> {
        if channel >= self.num_channels() {
            return Err(PslError::BadChannel);
        }
        Ok(())
    }

    /// Runs `f` on one channel under the channel lock.
    pub fn with_channel<R>(&self, channel: usize, f: impl FnOnce(&mut Channel) -> R) -> PslResult<R> {
        self.check_channel(channel)?;
        let mut channels = self.shared.channels();
        Ok(f(&mut channels[channel]))
    }

    pub fn channel_state(&self, channel: usize) -> PslResult<ChannelState> {
        self.with_channel(channel, |c| c.state)
    }

    /// Waits for the one-shot event armed with [`Channel::latch`].
    pub(crate) fn wait_latch(&self, channel: usize, timeout: Duration) -> PslResult<()> {
        self.check_channel(channel)?;
        let channels = self.shared.channels();
        let (mut channels, _) = self
            .shared
            .channel_event
            .wait_timeout_while(channels, timeout, |chs| !chs[channel].latch.is_fired())
            .unwrap_or_else(PoisonError::into_inner);
        channels[channel].latch.take().unwrap_or(Err(PslError::Timeout))
    }

    /// Waits until `done` holds for the channel or `timeout` passes.
    pub fn wait_for(
        &self,
        channel: usize,
        timeout: Duration,
        done: impl Fn(&Channel) -> bool,
    ) -> PslResult<()> {
        self.check_channel(channel)?;
        let deadline = Instant::now() + timeout;
        let mut channels = self.shared.channels();
        while !done(&channels[channel]) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(PslError::Timeout);
            }
            channels = self
                .shared
                .channel_event
                .wait_timeout(channels, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(())
    }

    /// Sends `request` and waits for the responses that complete it.
    pub fn call(&self, request: Request) -> PslResult<Vec<Response>> {
        self.call_timeout(request, self.shared.options.response_timeout)
    }

    pub fn call_timeout(&self, request: Request, timeout: Duration) -> PslResult<Vec<Response>> {
        if !self.is_connected() {
            return Err(PslError::NotConnected);
        }
        if let Some(ch) = request.channel() {
            if ch != ALL_CHANNELS && (ch < 0 || ch as usize >= self.num_channels()) {
                return Err(PslError::BadChannel);
            }
        }
        let mut writer = lock(&self.shared.writer);
        self.shared.correlator.begin(&request, self.num_channels())?;
        debug!("-> {:?} channel {:?}", request.message_type(), request.channel());
        if let Err(err) = writer.send(&request.encode()) {
            self.shared.correlator.cancel();
            if err.is_fatal() {
                drop(writer);
                self.shared.disconnect(err);
            }
            return Err(err);
        }
        self.shared.correlator.wait(timeout)
    }

    fn call_one(&self, request: Request) -> PslResult<Response> {
        self.call(request)?.pop().ok_or(PslError::InvalidRequest)
    }

    pub fn ping(&self) -> PslResult<()> {
        self.call(Request::Ping { verbose: false }).map(|_| ())
    }

    pub fn get_params(&self, channel: i32, keys: &[String]) -> PslResult<Vec<KeyValue>> {
        match self.call_one(Request::GetParams {
            channel,
            keys: keys.to_vec(),
        })? {
            Response::GetParamResponse { results, .. } => Ok(results),
            _ => Err(PslError::InvalidRequest),
        }
    }

    pub fn get_param(&self, channel: i32, key: &str) -> PslResult<ParamValue> {
        let results = match self.call_one(Request::GetParam {
            channel,
            key: key.to_string(),
        })? {
            Response::GetParamResponse { results, .. } => results,
            _ => return Err(PslError::InvalidRequest),
        };
        results
            .into_iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value)
            .ok_or(PslError::NotFound)
    }

    pub fn set_param(&self, channel: i32, key: &str, value: ParamValue) -> PslResult<()> {
        self.call(Request::SetParam {
            channel,
            param: KeyValue::new(key, value),
        })
        .map(|_| ())
    }

    pub fn set_params(&self, channel: i32, params: Vec<KeyValue>) -> PslResult<()> {
        if params.is_empty() {
            return Ok(());
        }
        self.call(Request::SetParams { channel, params }).map(|_| ())
    }

    pub fn list_param_details(&self, channel: i32, prefix: &str) -> PslResult<Vec<ParamDetails>> {
        match self.call_one(Request::ListParamDetails {
            channel,
            prefix: prefix.to_string(),
        })? {
            Response::ListParamDetailsResponse { details, .. } => Ok(details),
            _ => Err(PslError::InvalidRequest),
        }
    }

    /// Asks the card whether the channel parameters agree with each other.
    pub fn check_param_consistency(&self, channel: i32) -> PslResult<(bool, String)> {
        match self.call_one(Request::CheckParamConsistency { channel })? {
            Response::CheckParamConsistencyResponse {
                consistent,
                message,
                ..
            } => Ok((consistent, message)),
            _ => Err(PslError::InvalidRequest),
        }
    }

    pub fn calculate_dc_offset(&self, channel: usize) -> PslResult<f64> {
        self.check_channel(channel)?;
        match self.call_one(Request::CalculateDcOffset {
            channel: channel as i32,
        })? {
            Response::CalculateDcOffsetResponse { offset, .. } => Ok(offset),
            _ => Err(PslError::InvalidRequest),
        }
    }

    pub fn save_configuration(&self) -> PslResult<()> {
        self.call(Request::SaveConfiguration).map(|_| ())
    }

    pub fn delete_saved_configuration(&self) -> PslResult<()> {
        self.call(Request::DeleteSavedConfiguration).map(|_| ())
    }

    pub fn restart(&self) -> PslResult<()> {
        self.call(Request::Restart).map(|_| ())
    }

    pub fn reset_spatial_system(&self) -> PslResult<()> {
        self.call(Request::ResetSpatialSystem).map(|_| ())
    }

    pub fn probe_datagram(&self) -> PslResult<()> {
        self.call(Request::ProbeDatagram).map(|_| ())
    }

    pub fn synchronize_log(&self, log_id: u64) -> PslResult<()> {
        self.call(Request::SynchronizeLog { log_id }).map(|_| ())
    }

    pub fn monitor_channels(&self, channels: &[i32]) -> PslResult<()> {
        self.call(Request::MonitorChannels {
            channels: channels.to_vec(),
        })
        .map(|_| ())
    }

    pub fn software_update(&self, image: Vec<u8>, checksum: &str, auto_restart: bool) -> PslResult<()> {
        info!("{}: uploading {} byte firmware image", self.alias(), image.len());
        self.call_timeout(
            Request::SoftwareUpdate {
                image,
                checksum: checksum.to_string(),
                auto_restart,
            },
            self.shared.options.state_change_timeout,
        )
        .map(|_| ())
    }

    /// `None` addresses every channel.
    pub(crate) fn targets(&self, channel: Option<usize>) -> PslResult<Vec<usize>> {
        match channel {
            Some(ch) => {
                self.check_channel(ch)?;
                Ok(vec![ch])
            }
            None => Ok((0..self.num_channels()).collect()),
        }
    }

    fn open_formatter(&self, ch: &Channel, run_number: u32) -> PslResult<(MappingModeControl, bool)> {
        let value = |name: &str| ch.value(name).unwrap_or(0.0);
        let mca_channels = registry::mca_channels(&ch.values)?;
        match MappingMode::from_value(value("mapping_mode"))? {
            MappingMode::Mca => Ok((MappingModeControl::open_mca(mca_channels)?, false)),
            MappingMode::FullSpectrum => {
                let list_mode = value("list_mode_variant") != 0.0;
                let config = FullSpectrumConfig {
                    detector_channel: ch.index as u16,
                    run_number,
                    mca_channels,
                    pixels_per_buffer: value("num_map_pixels_per_buffer").max(1.0) as u32,
                    num_pixels: value("num_map_pixels").max(0.0) as u32,
                    list_mode,
                    sample_rate: ch.features.sample_rate,
                };
                Ok((MappingModeControl::open_full_spectrum(config)?, list_mode))
            }
            MappingMode::Sca | MappingMode::List => Err(PslError::InvalidValue),
        }
    }

    /// Opens the output formatters and starts acquisition. `None` starts every
    /// channel with one broadcast request when they all run the same way.
    pub fn start_run(&self, channel: Option<usize>) -> PslResult<()> {
        let targets = self.targets(channel)?;
        let run_number = self.shared.run_number.fetch_add(1, Ordering::SeqCst) + 1;
        let mut list_mode = Vec::with_capacity(targets.len());
        {
            let mut channels = self.shared.channels();
            for &ch in &targets {
                if channels[ch].state != ChannelState::Ready {
                    return Err(PslError::NotIdle);
                }
            }
            for &ch in &targets {
                let (control, lm) = self.open_formatter(&channels[ch], run_number)?;
                channels[ch].mapping = control;
                list_mode.push(lm);
            }
        }

        let request = |channel: i32, lm: bool| {
            if lm {
                Request::StartListMode { channel }
            } else {
                Request::StartHistogram { channel }
            }
        };
        let uniform = list_mode.iter().all(|&lm| lm == list_mode[0]);
        let result = if channel.is_none() && uniform && targets.len() > 1 {
            self.call(request(ALL_CHANNELS, list_mode[0])).map(|_| ())
        } else {
            targets
                .iter()
                .zip(&list_mode)
                .try_for_each(|(&ch, &lm)| self.call(request(ch as i32, lm)).map(|_| ()))
        };

        let mut channels = self.shared.channels();
        for (&ch, &lm) in targets.iter().zip(&list_mode) {
            let c = &mut channels[ch];
            match result {
                Ok(()) => {
                    let transition = if lm {
                        Transition::StartListMode
                    } else {
                        Transition::StartHistogram
                    };
                    c.apply(transition)?;
                }
                Err(_) => c.mapping = MappingModeControl::None,
            }
        }
        if result.is_ok() {
            info!("{}: run {} started on {:?}", self.alias(), run_number, targets);
        }
        result
    }

    /// Stops acquisition and closes any partially filled mapping buffer.
    pub fn stop_run(&self, channel: Option<usize>) -> PslResult<()> {
        let targets = self.targets(channel)?;
        let request_channel = match channel {
            Some(ch) => ch as i32,
            None => ALL_CHANNELS,
        };
        let result = self.call(Request::Stop {
            channel: request_channel,
        });
        let mut channels = self.shared.channels();
        for &ch in &targets {
            let c = &mut channels[ch];
            if let Err(err) = c.mapping.flush() {
                warn!("channel {}: flushing mapping buffer failed: {}", ch, err);
            }
            if c.state != ChannelState::Disconnected {
                c.apply(Transition::Stop)?;
                c.characterization.running = false;
            }
        }
        result.map(|_| ())
    }

    /// Arms the channel's one-shot latch for `event`.
    pub(crate) fn arm(&self, channel: usize, event: AsyncEvent) -> PslResult<()> {
        self.with_channel(channel, |c| c.latch.arm(event))
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        self.close();
    }
}
