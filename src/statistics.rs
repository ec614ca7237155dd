//! Per-endpoint performance statistics.
//!
//! Counters are always gathered. Durations depend on the [StatClock]: [FullClock] takes real
//!  timestamps, while [LightClock] uses zero-sized placeholders so timed regions compile down to
//!  nothing. The cargo feature `full-statistics` selects [FullClock] as [DefaultClock].

use std::fmt::{Debug, Display, Formatter};
use std::ops::AddAssign;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait StatClock: Debug + Clone + Copy + Default + Send + Sync + 'static {
    type Time: Debug + Clone + Copy + Send + Sync + 'static;
    type Duration: Debug + Clone + Copy + Default + AddAssign + PartialEq + Send + Sync + 'static;

    fn now() -> Self::Time;

    fn elapsed(since: Self::Time) -> Self::Duration;

    /// `None` if the clock does not measure time
    fn as_secs_f64(duration: &Self::Duration) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FullClock;

impl StatClock for FullClock {
    // tokio's clock can be paused and advanced in tests
    type Time = tokio::time::Instant;
    type Duration = Duration;

    fn now() -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn elapsed(since: tokio::time::Instant) -> Duration {
        since.elapsed()
    }

    fn as_secs_f64(duration: &Duration) -> Option<f64> {
        Some(duration.as_secs_f64())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LightClock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoDuration;

impl AddAssign for NoDuration {
    fn add_assign(&mut self, _: NoDuration) {}
}

impl StatClock for LightClock {
    type Time = NoTime;
    type Duration = NoDuration;

    fn now() -> NoTime {
        NoTime
    }

    fn elapsed(_: NoTime) -> NoDuration {
        NoDuration
    }

    fn as_secs_f64(_: &NoDuration) -> Option<f64> {
        None
    }
}

#[cfg(feature = "full-statistics")]
pub type DefaultClock = FullClock;
#[cfg(not(feature = "full-statistics"))]
pub type DefaultClock = LightClock;

#[derive(Debug, Clone, Default)]
pub struct Statistics<C: StatClock = DefaultClock> {
    // send side
    pub send_msg_sum: u64,
    pub send_byte_sum: u64,
    /// time messages spent in the send queue before being written
    pub send_delay_sum: C::Duration,
    /// time spent writing to the wire
    pub send_time_sum: C::Duration,
    pub pack_time_sum: C::Duration,

    // receive side
    pub recv_msg_sum: u64,
    pub recv_byte_sum: u64,
    /// time messages spent in the receive queue before being dispatched
    pub dispatch_delay_sum: C::Duration,
    /// time dispatch was paused because the handler did not consume all offered messages
    pub recv_idle_sum: C::Duration,
    pub handle_time_sum: C::Duration,
    pub unpack_time_sum: C::Duration,

    pub last_send_time: Option<SystemTime>,
    pub last_recv_time: Option<SystemTime>,
    pub establish_time: Option<SystemTime>,
    pub break_time: Option<SystemTime>,
}

impl <C: StatClock> Statistics<C> {
    pub fn new() -> Statistics<C> {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    /// sets `establish_time` unless it is set already
    pub fn mark_established(&mut self) {
        self.establish_time.get_or_insert_with(SystemTime::now);
    }

    /// sets `break_time` unless it is set already
    pub fn mark_broken(&mut self) {
        self.break_time.get_or_insert_with(SystemTime::now);
    }

    pub fn on_sent(&mut self, num_bytes: usize) {
        self.send_msg_sum += 1;
        self.send_byte_sum += num_bytes as u64;
        self.last_send_time = Some(SystemTime::now());
    }

    pub fn on_received(&mut self, num_msgs: usize, num_bytes: usize) {
        if num_msgs == 0 {
            return;
        }
        self.recv_msg_sum += num_msgs as u64;
        self.recv_byte_sum += num_bytes as u64;
        self.last_recv_time = Some(SystemTime::now());
    }
}

/// Combines counters and durations. Instants are per endpoint and are left unchanged.
impl <C: StatClock> AddAssign<&Statistics<C>> for Statistics<C> {
    fn add_assign(&mut self, rhs: &Statistics<C>) {
        self.send_msg_sum += rhs.send_msg_sum;
        self.send_byte_sum += rhs.send_byte_sum;
        self.send_delay_sum += rhs.send_delay_sum;
        self.send_time_sum += rhs.send_time_sum;
        self.pack_time_sum += rhs.pack_time_sum;

        self.recv_msg_sum += rhs.recv_msg_sum;
        self.recv_byte_sum += rhs.recv_byte_sum;
        self.dispatch_delay_sum += rhs.dispatch_delay_sum;
        self.recv_idle_sum += rhs.recv_idle_sum;
        self.handle_time_sum += rhs.handle_time_sum;
        self.unpack_time_sum += rhs.unpack_time_sum;
    }
}

impl <C: StatClock> AddAssign for Statistics<C> {
    fn add_assign(&mut self, rhs: Statistics<C>) {
        *self += &rhs;
    }
}

struct Secs<'a, C: StatClock>(&'a C::Duration);

impl <C: StatClock> Display for Secs<'_, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match C::as_secs_f64(self.0) {
            Some(secs) => write!(f, "{:.6}s", secs),
            None => write!(f, "-"),
        }
    }
}

struct Instant(Option<SystemTime>);

impl Display for Instant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0.and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
            Some(d) => write!(f, "{}.{:03}", d.as_secs(), d.subsec_millis()),
            None => write!(f, "-"),
        }
    }
}

impl <C: StatClock> Display for Statistics<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "send:")?;
        writeln!(f, "  messages: {}", self.send_msg_sum)?;
        writeln!(f, "  bytes: {}", self.send_byte_sum)?;
        writeln!(f, "  pack time: {}", Secs::<C>(&self.pack_time_sum))?;
        writeln!(f, "  send delay: {}", Secs::<C>(&self.send_delay_sum))?;
        writeln!(f, "  send time: {}", Secs::<C>(&self.send_time_sum))?;
        writeln!(f, "receive:")?;
        writeln!(f, "  messages: {}", self.recv_msg_sum)?;
        writeln!(f, "  bytes: {}", self.recv_byte_sum)?;
        writeln!(f, "  unpack time: {}", Secs::<C>(&self.unpack_time_sum))?;
        writeln!(f, "  dispatch delay: {}", Secs::<C>(&self.dispatch_delay_sum))?;
        writeln!(f, "  handle time: {}", Secs::<C>(&self.handle_time_sum))?;
        writeln!(f, "  recv idle: {}", Secs::<C>(&self.recv_idle_sum))?;
        writeln!(f, "last send: {}", Instant(self.last_send_time))?;
        writeln!(f, "last receive: {}", Instant(self.last_recv_time))?;
        writeln!(f, "established: {}", Instant(self.establish_time))?;
        write!(f, "broken: {}", Instant(self.break_time))
    }
}

/// Measures a region of code, adding the elapsed time to a duration when [AutoDuration::end] is
///  called or the guard is dropped - whichever happens first.
pub struct AutoDuration<'a, C: StatClock> {
    begin: Option<C::Time>,
    target: &'a mut C::Duration,
}

impl <'a, C: StatClock> AutoDuration<'a, C> {
    pub fn new(target: &'a mut C::Duration) -> AutoDuration<'a, C> {
        AutoDuration {
            begin: Some(C::now()),
            target,
        }
    }

    /// idempotent: only the first call adds to the target
    pub fn end(&mut self) {
        if let Some(begin) = self.begin.take() {
            *self.target += C::elapsed(begin);
        }
    }
}

impl <C: StatClock> Drop for AutoDuration<'_, C> {
    fn drop(&mut self) {
        self.end();
    }
}
