//! The four-timer cascade. Grounded directly on the reference `timer.c`:
//! the `{0,6,8,10}` prescaler-shift table, the "2-cycle start delay" on
//! enable, the "1-cycle stop delay" on disable, and the recursive
//! count-up cascade on overflow.

use crate::interrupt::Irq;
use crate::io_regs::IoRegs;
use crate::scheduler::{EventArgs, EventHandle, EventKind, Scheduler};

const PRESCALER_SHIFT: [u32; 4] = [0, 6, 8, 10];

pub struct Timer {
    index: usize,
    counter: u16,
    reload: u16,
    control: u16,
    handler: EventHandle,
}

impl Timer {
    fn new(index: usize) -> Self {
        Timer { index, counter: 0, reload: 0, control: 0, handler: EventHandle::INVALID }
    }

    pub fn enabled(&self) -> bool {
        (self.control >> 7) & 1 != 0
    }
    pub fn count_up(&self) -> bool {
        (self.control >> 2) & 1 != 0
    }
    pub fn irq_enabled(&self) -> bool {
        (self.control >> 6) & 1 != 0
    }
    pub fn prescaler(&self) -> usize {
        (self.control & 0x3) as usize
    }
    fn shift(&self) -> u32 {
        PRESCALER_SHIFT[self.prescaler()]
    }

    pub fn reload_value(&self) -> u16 {
        self.reload
    }
}

pub struct Timers {
    timers: [Timer; 4],
}

impl Timers {
    pub fn new() -> Self {
        Timers { timers: [Timer::new(0), Timer::new(1), Timer::new(2), Timer::new(3)] }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn timer(&self, idx: usize) -> &Timer {
        &self.timers[idx]
    }

    /// Live counter value: while running and not count-up, the counter is
    /// derived from the signed distance to the scheduled overflow event
    /// rather than tracked incrementally, matching the reference
    /// `timer_update_counter`'s wraparound-subtraction trick — `cycles -
    /// at` underflows to a huge `u64` while the timer hasn't overflowed yet,
    /// but shifting and truncating to `u16` recovers the right low bits.
    pub fn read_counter(&self, idx: usize, sched: &Scheduler) -> u16 {
        let t = &self.timers[idx];
        if t.enabled() && !t.count_up() {
            match sched.at_of(t.handler) {
                Some(at) => {
                    let elapsed = sched.cycles().wrapping_sub(at);
                    (elapsed >> t.shift()) as u16
                }
                None => t.counter,
            }
        } else {
            t.counter
        }
    }

    pub fn write_reload(&mut self, idx: usize, val: u16) {
        self.timers[idx].reload = val;
    }

    pub fn reload(&self, idx: usize) -> u16 {
        self.timers[idx].reload
    }

    pub fn control(&self, idx: usize) -> u16 {
        self.timers[idx].control
    }

    pub fn counter_raw(&self, idx: usize) -> u16 {
        self.timers[idx].counter
    }

    /// Writes TMxCNT_H, handling the enable-transition bookkeeping.
    pub fn write_control(&mut self, idx: usize, val: u16, sched: &mut Scheduler) {
        let old_enable = self.timers[idx].enabled();
        self.timers[idx].control = val & 0xC7;
        let new_enable = self.timers[idx].enabled();

        if !old_enable && new_enable {
            self.start(idx, sched);
        } else if old_enable && !new_enable {
            self.schedule_stop(idx, sched);
        }
    }

    fn start(&mut self, idx: usize, sched: &mut Scheduler) {
        self.timers[idx].counter = self.timers[idx].reload;

        if !self.timers[idx].count_up() {
            let period = (0x1_0000 - self.timers[idx].counter as u32) as u64 << self.timers[idx].shift();
            let at = sched.cycles() + period + 2;
            self.timers[idx].handler = sched.add(at, true, period, EventKind::TimerOverflow, EventArgs::single(idx as u32));
        } else {
            self.timers[idx].handler = EventHandle::INVALID;
        }
    }

    fn schedule_stop(&mut self, idx: usize, sched: &mut Scheduler) {
        sched.add(sched.cycles() + 1, false, 0, EventKind::TimerStop, EventArgs::single(idx as u32));
    }

    /// Handler for a fired `EventKind::TimerStop` event: finalises the
    /// counter value from the cancelled overflow event's scheduled time
    /// (the same wraparound trick as `live_counter`) and cancels it.
    pub fn on_stop_fired(&mut self, idx: usize, sched: &mut Scheduler) {
        self.timers[idx].control &= !(1 << 7);
        if self.timers[idx].handler.is_valid() {
            if let Some(at) = sched.at_of(self.timers[idx].handler) {
                let elapsed = sched.cycles().wrapping_sub(at);
                self.timers[idx].counter = (elapsed >> self.timers[idx].shift()) as u16;
            }
            sched.cancel(self.timers[idx].handler);
            self.timers[idx].handler = EventHandle::INVALID;
        }
    }

    /// Handler for a fired `EventKind::TimerOverflow` event. Returns the set
    /// of timer indices that should trigger an APU FIFO-drain check (0, 1),
    /// since the APU is a sibling subsystem the caller threads through.
    pub fn on_overflow(&mut self, idx: usize, io: &mut IoRegs) -> bool {
        self.timers[idx].counter = self.timers[idx].reload;

        if self.timers[idx].irq_enabled() {
            io.raise_irq(Irq::timer(idx));
        }

        let feeds_apu = idx == 0 || idx == 1;

        if idx < 3 && self.timers[idx + 1].enabled() && self.timers[idx + 1].count_up() {
            let next = self.timers[idx + 1].counter as u32 + 1;
            if next == 0x1_0000 {
                // Recurse: cascading overflow into timer idx+1.
                let _ = self.on_overflow(idx + 1, io);
            } else {
                self.timers[idx + 1].counter = next as u16;
            }
        }

        feeds_apu
    }

    /// Extends the "I/O block" quicksave section with each timer's live
    /// counter, reload, control and its overflow event handle's raw index.
    pub fn write_state(&self, w: &mut crate::quicksave::Writer) {
        for t in &self.timers {
            w.u16(t.counter);
            w.u16(t.reload);
            w.u16(t.control);
            w.u32(t.handler.raw_index());
        }
    }

    pub fn read_state(&mut self, r: &mut crate::quicksave::Reader) -> crate::error::EngineResult<()> {
        for t in self.timers.iter_mut() {
            t.counter = r.u16()?;
            t.reload = r.u16()?;
            t.control = r.u16()?;
            t.handler = crate::scheduler::EventHandle::from_raw_index(r.u32()?);
        }
        Ok(())
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_from_0xfffe_fires_after_shift_plus_2_cycles() {
        let mut timers = Timers::new();
        let mut sched = Scheduler::new();
        timers.write_reload(0, 0xFFFE);
        timers.write_control(0, 0b1000_0000, &mut sched); // enable, prescaler 0

        assert_eq!(sched.next_event(), (1u64 << 0) + 2);
    }

    #[test]
    fn timer_cascade_increments_next_timer_thrice() {
        let mut timers = Timers::new();
        let mut sched = Scheduler::new();
        let mut io = IoRegs::new();

        timers.write_reload(0, 0xFFFE);
        timers.write_control(0, 0b1000_0000, &mut sched); // timer0 enable, prescaler 0

        timers.write_control(1, 0b1000_0100, &mut sched); // timer1 enable, count_up

        for _ in 0..3 {
            sched.advance(sched.next_event().saturating_sub(sched.cycles()).max(1));
            sched.process_events(|s, firing| {
                if firing.kind == crate::scheduler::EventKind::TimerOverflow {
                    timers.on_overflow(firing.args.words[0] as usize, &mut io);
                }
                let _ = s;
            });
        }

        assert_eq!(timers.counter_raw(1), 3);
    }

    #[test]
    fn disabling_a_running_timer_schedules_a_deferred_stop() {
        let mut timers = Timers::new();
        let mut sched = Scheduler::new();
        timers.write_reload(0, 0);
        timers.write_control(0, 0b1000_0000, &mut sched);
        timers.write_control(0, 0b0000_0000, &mut sched);
        assert_eq!(sched.next_event(), sched.cycles() + 1);
    }
}
