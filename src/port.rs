//! Port — hardware tick driver boundary
//!
//! The kernel needs a free-running 64-bit tick counter, a single settable
//! expiry interrupt, and a way to request a deferred `schedule()` (PendSV
//! on Cortex-M). The driver calls [`Kernel::timeout_check`] from its
//! expiry interrupt.
//!
//! [`SoftPort`] is a software tick source for hosted builds and tests.
//!
//! Author: Moroya Sakamoto
//!
//! [`Kernel::timeout_check`]: crate::Kernel::timeout_check

use core::cell::Cell;

use critical_section::Mutex;

use crate::timer::Tick;

/// Platform services the kernel runs on.
///
/// Methods may be called from inside the kernel's critical section and
/// must not call back into the kernel.
pub trait Port: Sync {
    /// Monotonic ticks since boot
    fn tick_get(&self) -> Tick;

    /// Arm the expiry interrupt at `tick`; 0 disarms it
    fn set_expiry(&self, tick: Tick);

    /// Ask for `schedule()` to run soon at the lowest interrupt priority
    fn pend_schedule(&self);

    /// Ticks to milliseconds
    fn tick_to_ms(&self, ticks: Tick) -> i64;

    /// Ticks to microseconds
    fn tick_to_us(&self, ticks: Tick) -> i64;

    /// Microseconds to ticks
    fn us_to_tick(&self, us: u32) -> Tick;

    /// Milliseconds to ticks
    fn ms_to_tick(&self, ms: u32) -> Tick;
}

/// Software tick source
///
/// Time only moves when told to. The armed expiry and the pending-schedule
/// request are latched so a host loop (or a test) can act on them.
///
/// Size: 32 bytes
pub struct SoftPort {
    /// Current tick count
    now: Mutex<Cell<Tick>>,
    /// Armed expiry, 0 = disarmed
    expiry: Mutex<Cell<Tick>>,
    /// Schedule requested and not yet taken
    pending: Mutex<Cell<bool>>,
    /// Number of `set_expiry` calls
    arms: Mutex<Cell<u32>>,
    /// Tick frequency in Hz
    clock_hz: u32,
}

impl SoftPort {
    /// Software port ticking at `clock_hz`
    ///
    /// `clock_hz`: tick frequency (e.g. 48_000_000 or 32_768); 0 is
    /// taken as 1
    pub const fn new(clock_hz: u32) -> Self {
        Self {
            now: Mutex::new(Cell::new(0)),
            expiry: Mutex::new(Cell::new(0)),
            pending: Mutex::new(Cell::new(false)),
            arms: Mutex::new(Cell::new(0)),
            clock_hz: if clock_hz == 0 { 1 } else { clock_hz },
        }
    }

    /// One tick per microsecond
    pub const fn software() -> Self {
        Self::new(1_000_000)
    }

    /// Move time forward by `ticks`
    pub fn advance(&self, ticks: Tick) {
        critical_section::with(|cs| {
            let now = self.now.borrow(cs);
            now.set(now.get() + ticks);
        });
    }

    /// Jump to an absolute tick
    pub fn set_now(&self, tick: Tick) {
        critical_section::with(|cs| self.now.borrow(cs).set(tick));
    }

    /// Armed expiry, 0 = disarmed
    pub fn expiry(&self) -> Tick {
        critical_section::with(|cs| self.expiry.borrow(cs).get())
    }

    /// How often the expiry was (re)programmed
    pub fn arm_count(&self) -> u32 {
        critical_section::with(|cs| self.arms.borrow(cs).get())
    }

    /// Consume the pending-schedule request
    pub fn take_pending(&self) -> bool {
        critical_section::with(|cs| self.pending.borrow(cs).replace(false))
    }

    /// Tick frequency in Hz
    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }
}

/// `value * mul / div` without intermediate overflow, truncated toward zero
fn scale(value: i64, mul: u32, div: u32) -> i64 {
    let scaled = i128::from(value) * i128::from(mul) / i128::from(div);
    i64::try_from(scaled).unwrap_or(if scaled < 0 { i64::MIN } else { i64::MAX })
}

impl Default for SoftPort {
    fn default() -> Self {
        Self::software()
    }
}

impl Port for SoftPort {
    fn tick_get(&self) -> Tick {
        critical_section::with(|cs| self.now.borrow(cs).get())
    }

    fn set_expiry(&self, tick: Tick) {
        critical_section::with(|cs| {
            self.expiry.borrow(cs).set(tick);
            let arms = self.arms.borrow(cs);
            arms.set(arms.get().wrapping_add(1));
        });
    }

    fn pend_schedule(&self) {
        critical_section::with(|cs| self.pending.borrow(cs).set(true));
    }

    fn tick_to_ms(&self, ticks: Tick) -> i64 {
        scale(ticks, 1_000, self.clock_hz)
    }

    fn tick_to_us(&self, ticks: Tick) -> i64 {
        scale(ticks, 1_000_000, self.clock_hz)
    }

    fn us_to_tick(&self, us: u32) -> Tick {
        scale(i64::from(us), self.clock_hz, 1_000_000)
    }

    fn ms_to_tick(&self, ms: u32) -> Tick {
        scale(i64::from(ms), self.clock_hz, 1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_port() {
        let port = SoftPort::software();
        assert_eq!(port.tick_get(), 0);
        port.advance(1000);
        assert_eq!(port.tick_get(), 1000);
        assert_eq!(port.tick_to_ms(port.tick_get()), 1);
    }

    #[test]
    fn test_conversions_scale_with_clock() {
        let port = SoftPort::new(48_000_000);
        assert_eq!(port.clock_hz(), 48_000_000);
        assert_eq!(port.us_to_tick(10), 480);
        assert_eq!(port.ms_to_tick(2), 96_000);
        assert_eq!(port.tick_to_us(480), 10);
        assert_eq!(port.tick_to_ms(96_000), 2);
    }

    #[test]
    fn test_sub_megahertz_clock() {
        let port = SoftPort::new(32_768);
        assert_eq!(port.ms_to_tick(1000), 32_768);
        assert_eq!(port.tick_to_ms(32_768), 1000);
        assert_eq!(port.tick_to_us(32_768 * 3), 3_000_000);
        assert_eq!(port.us_to_tick(500_000), 16_384);
        // Below one tick rounds down
        assert_eq!(port.us_to_tick(30), 0);
    }

    #[test]
    fn test_zero_clock_taken_as_one_hz() {
        let port = SoftPort::new(0);
        assert_eq!(port.clock_hz(), 1);
        assert_eq!(port.ms_to_tick(3000), 3);
    }

    #[test]
    fn test_expiry_latched() {
        let port = SoftPort::software();
        port.set_expiry(500);
        port.set_expiry(0);
        assert_eq!(port.expiry(), 0);
        assert_eq!(port.arm_count(), 2);
    }

    #[test]
    fn test_pending_taken_once() {
        let port = SoftPort::software();
        assert!(!port.take_pending());
        port.pend_schedule();
        assert!(port.take_pending());
        assert!(!port.take_pending());
    }

    #[test]
    fn test_set_now() {
        let port = SoftPort::software();
        port.set_now(1 << 40);
        port.advance(1);
        assert_eq!(port.tick_get(), (1 << 40) + 1);
    }
}
