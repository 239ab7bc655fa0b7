//! Discrete-event scheduler: a flat table of time-stamped callbacks driven by
//! a monotonically increasing cycle counter.
//!
//! Grounded on the reference scheduler's `sched_process_events` /
//! `sched_add_event` / `sched_run_for` triad: a flat vector with stable
//! indices (reused once cancelled), a cached `next_event` cycle, and an
//! event-dispatch loop that rewinds the cycle counter for the duration of
//! each callback so callbacks observe the cycle they were scheduled for.

use crate::error::{EngineError, EngineResult};

/// Up to 4 tagged primitive words, enough for every scheduler callback this
/// engine needs (a DMA/timer channel index, a handle, a small flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventArgs {
    pub words: [u32; 4],
}

impl EventArgs {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn single(a: u32) -> Self {
        Self { words: [a, 0, 0, 0] }
    }

    pub fn pair(a: u32, b: u32) -> Self {
        Self { words: [a, b, 0, 0] }
    }
}

/// Identifies which subsystem callback a scheduled event invokes. A single
/// flat enum takes the place of the reference implementation's function
/// pointer, since callbacks must dispatch back into `Engine` (which owns the
/// scheduler) rather than close over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PpuHDraw,
    PpuHBlank,
    TimerOverflow,
    TimerStop,
    DmaArm,
    ApuSample,
}

#[derive(Debug, Clone, Copy)]
struct Event {
    active: bool,
    repeat: bool,
    at: u64,
    period: u64,
    kind: EventKind,
    args: EventArgs,
}

/// Stable handle into the scheduler's event table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(usize);

impl EventHandle {
    pub const INVALID: EventHandle = EventHandle(usize::MAX);

    pub fn is_valid(&self) -> bool {
        self.0 != usize::MAX
    }

    /// Raw table index, serialised as part of a sibling subsystem's
    /// quicksave state; meaningful only once the scheduler's own event table
    /// has been restored from the same snapshot, since indices are table
    /// positions rather than stable identifiers across tables.
    pub fn raw_index(&self) -> u32 {
        if self.0 == usize::MAX {
            u32::MAX
        } else {
            self.0 as u32
        }
    }

    pub fn from_raw_index(idx: u32) -> EventHandle {
        if idx == u32::MAX {
            EventHandle::INVALID
        } else {
            EventHandle(idx as usize)
        }
    }
}

/// A single firing pulled out of the table by `pop_due`, ready to be
/// dispatched by the caller (the caller owns all subsystem state, the
/// scheduler owns only timing).
pub struct Firing {
    pub kind: EventKind,
    pub args: EventArgs,
}

const GROW_STEP: usize = 5;

pub struct Scheduler {
    cycles: u64,
    next_event: u64,
    events: Vec<Event>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { cycles: 0, next_event: u64::MAX, events: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.cycles = 0;
        self.next_event = u64::MAX;
        self.events.clear();
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn advance(&mut self, cycles: u64) {
        self.cycles += cycles;
    }

    pub fn due(&self) -> bool {
        self.cycles >= self.next_event
    }

    /// Registers an event, reusing the first inactive slot if one exists,
    /// else growing the table by `GROW_STEP` slots.
    pub fn add(&mut self, at: u64, repeat: bool, period: u64, kind: EventKind, args: EventArgs) -> EventHandle {
        debug_assert!(!repeat || period > 0);

        let slot = self.events.iter().position(|e| !e.active);
        let idx = match slot {
            Some(i) => {
                self.events[i] = Event { active: true, repeat, at, period, kind, args };
                i
            }
            None => {
                let base = self.events.len();
                self.events.resize(
                    base + GROW_STEP,
                    Event { active: false, repeat: false, at: 0, period: 0, kind, args: EventArgs::none() },
                );
                self.events[base] = Event { active: true, repeat, at, period, kind, args };
                base
            }
        };

        if at < self.next_event {
            self.next_event = at;
        }
        EventHandle(idx)
    }

    pub fn cancel(&mut self, handle: EventHandle) {
        if let Some(e) = self.events.get_mut(handle.0) {
            e.active = false;
        }
    }

    /// Pops exactly one due event (ties broken by earliest slot index),
    /// rewinding the cycle counter to the timestamp it fired at. The caller
    /// must call `restore` once it has finished processing the firing.
    ///
    /// Returns `None` once no active event has `at <= cycles`; at that point
    /// `next_event` has been recomputed as the minimum `at` among the
    /// remaining active events.
    pub fn pop_due(&mut self) -> Option<(Firing, u64)> {
        let mut chosen: Option<usize> = None;
        let mut next_event = u64::MAX;

        for (i, e) in self.events.iter().enumerate() {
            if !e.active {
                continue;
            }
            if e.at <= self.cycles {
                if chosen.map_or(true, |c| e.at < self.events[c].at) {
                    chosen = Some(i);
                }
            } else if e.at < next_event {
                next_event = e.at;
            }
        }

        self.next_event = next_event;

        let idx = chosen?;
        let delay = self.cycles - self.events[idx].at;
        self.cycles -= delay;

        let (kind, args) = {
            let e = &mut self.events[idx];
            if e.repeat {
                e.at += e.period;
                if e.at < self.next_event {
                    self.next_event = e.at;
                }
            } else {
                e.active = false;
            }
            (e.kind, e.args)
        };

        Some((Firing { kind, args }, delay))
    }

    /// Restores the cycle counter after the caller has invoked the callback
    /// for a firing returned by `pop_due`.
    pub fn restore(&mut self, delay: u64) {
        self.cycles += delay;
    }

    /// Drains every due event, dispatching each through `dispatch`.
    pub fn process_events(&mut self, mut dispatch: impl FnMut(&mut Scheduler, Firing)) {
        loop {
            match self.pop_due() {
                Some((firing, delay)) => {
                    dispatch(self, firing);
                    self.restore(delay);
                }
                None => break,
            }
        }
    }

    pub fn next_event(&self) -> u64 {
        self.next_event
    }

    /// Absolute cycle timestamp a still-active handle is scheduled to fire
    /// at. Used by `Timers::live_counter` to derive a running, non-count-up
    /// timer's current value without tracking it incrementally.
    pub fn at_of(&self, handle: EventHandle) -> Option<u64> {
        self.events.get(handle.0).filter(|e| e.active).map(|e| e.at)
    }

    /// Guards against the "zero-cycle instruction outside STOP" livelock
    /// named in the error-handling design: callers pass the number of
    /// cycles an instruction step advanced and the current core state.
    pub fn check_progress(advanced: u64, is_stopped: bool) -> EngineResult<()> {
        if advanced == 0 && !is_stopped {
            return Err(EngineError::SchedulerLivelock);
        }
        Ok(())
    }

    /// Appends `scheduler.next_event` followed by `events_size` event
    /// records `{active, repeat, at, period, args}`, in table-index order so
    /// a restored table keeps the same `EventHandle` indices every other
    /// subsystem's state was saved holding.
    pub fn write_state(&self, w: &mut crate::quicksave::Writer) {
        w.u64(self.cycles);
        w.u64(self.next_event);
        w.u32(self.events.len() as u32);
        for e in &self.events {
            w.bool(e.active);
            w.bool(e.repeat);
            w.u64(e.at);
            w.u64(e.period);
            w.u8(event_kind_tag(e.kind));
            for word in e.args.words {
                w.u32(word);
            }
        }
    }

    pub fn read_state(&mut self, r: &mut crate::quicksave::Reader) -> EngineResult<()> {
        self.cycles = r.u64()?;
        self.next_event = r.u64()?;
        let count = r.u32()? as usize;
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            let active = r.bool()?;
            let repeat = r.bool()?;
            let at = r.u64()?;
            let period = r.u64()?;
            let kind = event_kind_from_tag(r.u8()?)?;
            let mut words = [0u32; 4];
            for w in words.iter_mut() {
                *w = r.u32()?;
            }
            events.push(Event { active, repeat, at, period, kind, args: EventArgs { words } });
        }
        self.events = events;
        Ok(())
    }
}

fn event_kind_tag(kind: EventKind) -> u8 {
    match kind {
        EventKind::PpuHDraw => 0,
        EventKind::PpuHBlank => 1,
        EventKind::TimerOverflow => 2,
        EventKind::TimerStop => 3,
        EventKind::DmaArm => 4,
        EventKind::ApuSample => 5,
    }
}

fn event_kind_from_tag(tag: u8) -> EngineResult<EventKind> {
    Ok(match tag {
        0 => EventKind::PpuHDraw,
        1 => EventKind::PpuHBlank,
        2 => EventKind::TimerOverflow,
        3 => EventKind::TimerStop,
        4 => EventKind::DmaArm,
        5 => EventKind::ApuSample,
        other => return Err(EngineError::SnapshotMismatch(format!("unknown event kind tag {other}"))),
    })
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_timestamp_order_with_slot_tiebreak() {
        let mut sched = Scheduler::new();
        sched.add(10, false, 0, EventKind::TimerOverflow, EventArgs::single(1));
        sched.add(5, false, 0, EventKind::TimerOverflow, EventArgs::single(2));
        sched.add(5, false, 0, EventKind::TimerOverflow, EventArgs::single(3));

        sched.advance(20);

        let mut order = Vec::new();
        sched.process_events(|_s, firing| order.push(firing.args.words[0]));

        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn cancelled_event_does_not_fire() {
        let mut sched = Scheduler::new();
        let h = sched.add(10, false, 0, EventKind::TimerOverflow, EventArgs::none());
        sched.cancel(h);
        sched.advance(20);

        let mut fired = false;
        sched.process_events(|_s, _f| fired = true);
        assert!(!fired);
    }

    #[test]
    fn cancelled_slot_is_reused() {
        let mut sched = Scheduler::new();
        let h1 = sched.add(10, false, 0, EventKind::TimerOverflow, EventArgs::none());
        sched.cancel(h1);
        let h2 = sched.add(20, false, 0, EventKind::TimerOverflow, EventArgs::none());
        assert_eq!(h1, h2);
    }

    #[test]
    fn repeating_event_reschedules_with_period() {
        let mut sched = Scheduler::new();
        sched.add(5, true, 10, EventKind::PpuHDraw, EventArgs::none());

        sched.advance(5);
        let mut count = 0;
        sched.process_events(|_s, _f| count += 1);
        assert_eq!(count, 1);
        assert_eq!(sched.next_event(), 15);
    }

    #[test]
    fn next_event_at_least_cycles_after_process() {
        let mut sched = Scheduler::new();
        sched.add(5, false, 0, EventKind::PpuHBlank, EventArgs::none());
        sched.add(50, false, 0, EventKind::PpuHBlank, EventArgs::none());

        sched.advance(5);
        sched.process_events(|_s, _f| {});
        assert!(sched.next_event() >= sched.cycles());
    }

    #[test]
    fn grows_table_when_all_slots_active() {
        let mut sched = Scheduler::new();
        for i in 0..8 {
            sched.add(100 + i, true, 50, EventKind::TimerOverflow, EventArgs::single(i as u32));
        }
        assert!(sched.events.len() >= 8);
    }
}
