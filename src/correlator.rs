//! Matches card responses to the one request in flight on a module.
//!
//! Requests carry no sequence number. A response completes the pending call
//! when its type is the one the request expects and its channel fits. A
//! broadcast request (channel -1) to a channel-scoped command completes after
//! one response per channel. Responses still owed to a call that timed out
//! are discarded when they arrive.

use crate::codec::{MessageType, Request, Response, ALL_CHANNELS};
use crate::{PslError, PslResult};
use log::{debug, warn};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Response type and count that complete `request` on a card with
/// `channels` channels.
pub fn completion(request: &Request, channels: usize) -> PslResult<(MessageType, usize)> {
    use MessageType as T;
    let broadcast = request.channel() == Some(ALL_CHANNELS);
    let per_channel = if broadcast { channels.max(1) } else { 1 };
    let expected = match request {
        Request::Ping { .. }
        | Request::SaveConfiguration
        | Request::DeleteSavedConfiguration
        | Request::Restart
        | Request::ResetSpatialSystem
        | Request::ProbeDatagram
        | Request::SynchronizeLog { .. }
        | Request::MonitorChannels { .. }
        | Request::SoftwareUpdate { .. } => return Ok((T::Success, 1)),
        Request::SetParam { .. }
        | Request::SetParams { .. }
        | Request::StartOscilloscope { .. }
        | Request::StartHistogram { .. }
        | Request::StartFft { .. }
        | Request::StartListMode { .. }
        | Request::StartCalibration { .. }
        | Request::Stop { .. }
        | Request::SetCalibration { .. } => return Ok((T::Success, per_channel)),
        Request::GetParam { .. } | Request::GetParams { .. } => T::GetParamResponse,
        Request::ListParamDetails { .. } => T::ListParamDetailsResponse,
        Request::CheckParamConsistency { .. } => T::CheckParamConsistencyResponse,
        Request::GetCalibration { .. } | Request::CalculateDcOffset { .. } if broadcast => {
            return Err(PslError::InvalidValue)
        }
        Request::GetCalibration { .. } => T::GetCalibrationResponse,
        Request::CalculateDcOffset { .. } => T::CalculateDcOffsetResponse,
    };
    Ok((expected, 1))
}

/// True for message types that only ever answer a request.
pub fn is_solicited(ty: MessageType) -> bool {
    matches!(
        ty,
        MessageType::Success
            | MessageType::GetParamResponse
            | MessageType::GetCalibrationResponse
            | MessageType::CalculateDcOffsetResponse
            | MessageType::ListParamDetailsResponse
            | MessageType::CheckParamConsistencyResponse
    )
}

#[derive(Debug)]
struct Pending {
    expected: MessageType,
    /// `None` for module-wide requests.
    channel: Option<i32>,
    remaining: usize,
    responses: Vec<Response>,
    outcome: Option<PslResult<()>>,
}

/// Whether a response for `got` answers a request sent to `want`.
fn channel_fits(want: Option<i32>, got: Option<i32>) -> bool {
    match (want, got) {
        (None, _) | (Some(ALL_CHANNELS), _) | (_, None) => true,
        (Some(want), Some(got)) => want == got,
    }
}

impl Pending {
    fn accepts_channel(&self, channel: Option<i32>) -> bool {
        channel_fits(self.channel, channel)
    }
}

/// Responses owed to an abandoned call.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Owed {
    expected: MessageType,
    channel: Option<i32>,
    remaining: usize,
}

impl Owed {
    fn matches(&self, ty: MessageType, channel: Option<i32>) -> bool {
        ty == self.expected && channel_fits(self.channel, channel)
    }
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<Pending>,
    owed: Vec<Owed>,
}

/// The response slot of a module.
#[derive(Debug, Default)]
pub struct Correlator {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the slot for `request`. The caller must hold the module send
    /// lock.
    pub fn begin(&self, request: &Request, channels: usize) -> PslResult<()> {
        let (expected, count) = completion(request, channels)?;
        let mut slot = lock(&self.slot);
        if slot.pending.is_some() {
            return Err(PslError::MultipleThreadWait);
        }
        slot.pending = Some(Pending {
            expected,
            channel: request.channel(),
            remaining: count,
            responses: Vec::with_capacity(count),
            outcome: None,
        });
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        lock(&self.slot).pending.is_none()
    }

    /// Number of responses still owed to abandoned calls.
    pub fn owed(&self) -> usize {
        lock(&self.slot).owed.iter().map(|o| o.remaining).sum()
    }

    /// Clears the slot without waiting.
    pub fn cancel(&self) {
        lock(&self.slot).pending.take();
    }

    /// Offers a decoded message to the pending call. Messages that are not
    /// responses come back to the caller for asynchronous handling; stray
    /// responses are dropped.
    pub fn offer(&self, response: Response) -> Option<Response> {
        let ty = response.message_type();
        if !is_solicited(ty) {
            return Some(response);
        }
        let mut slot = lock(&self.slot);
        let channel = response.channel();
        if let Some(i) = slot.owed.iter().position(|o| o.matches(ty, channel)) {
            warn!("discarding late {:?} for channel {:?}", ty, channel);
            slot.owed[i].remaining -= 1;
            if slot.owed[i].remaining == 0 {
                slot.owed.remove(i);
            }
            return None;
        }
        let pending = match slot.pending.as_mut() {
            Some(p) if p.outcome.is_none() => p,
            _ => {
                warn!("dropping unsolicited {:?} for channel {:?}", ty, response.channel());
                return None;
            }
        };
        if ty != pending.expected || !pending.accepts_channel(response.channel()) {
            warn!(
                "dropping {:?} for channel {:?} while waiting for {:?}",
                ty,
                response.channel(),
                pending.expected
            );
            return None;
        }
        if let Some(err) = response.error().filter(|e| e.code != 0) {
            debug!("card refused request: {} ({})", err.message, err.code);
            pending.outcome = Some(Err(err.to_error()));
        } else {
            pending.remaining = pending.remaining.saturating_sub(1);
            if pending.remaining == 0 {
                pending.outcome = Some(Ok(()));
            }
        }
        pending.responses.push(response);
        if pending.outcome.is_some() {
            self.ready.notify_all();
        }
        None
    }

    /// Completes a call pending on `channel` (or a broadcast call) with
    /// `err`. Returns false when nothing was waiting for it.
    pub fn fail_channel(&self, channel: Option<i32>, err: PslError) -> bool {
        let mut slot = lock(&self.slot);
        match slot.pending.as_mut() {
            Some(p) if p.outcome.is_none() && p.accepts_channel(channel) => {
                p.outcome = Some(Err(err));
                self.ready.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Completes any pending call with a fatal error.
    pub fn abort(&self, err: PslError) {
        let mut slot = lock(&self.slot);
        slot.owed.clear();
        if let Some(p) = slot.pending.as_mut() {
            if p.outcome.is_none() {
                p.outcome = Some(Err(err));
            }
        }
        self.ready.notify_all();
    }

    /// Waits for the armed call to complete and empties the slot.
    pub fn wait(&self, timeout: Duration) -> PslResult<Vec<Response>> {
        let slot = lock(&self.slot);
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |s| {
                s.pending.as_ref().is_some_and(|p| p.outcome.is_none())
            })
            .unwrap_or_else(PoisonError::into_inner);
        let pending = slot.pending.take().ok_or(PslError::InvalidRequest)?;
        match pending.outcome {
            Some(Ok(())) => Ok(pending.responses),
            Some(Err(err)) => Err(err),
            None => {
                warn!(
                    "no {:?} within {} ms, giving up",
                    pending.expected,
                    timeout.as_millis()
                );
                slot.owed.push(Owed {
                    expected: pending.expected,
                    channel: pending.channel,
                    remaining: pending.remaining,
                });
                Err(PslError::Timeout)
            }
        }
    }
}
