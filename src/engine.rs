//! The engine: owns every subsystem, runs the frame loop on its own thread,
//! and is the only thing the frontend talks to. Grounded on §4.8's loop
//! pseudocode and §5's concurrency model — one worker thread, two mailboxes,
//! two mutex-guarded shared buffers, one atomic pause latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::apu::Apu;
use crate::bus::backup::BackupKind;
use crate::bus::Bus;
use crate::channel::{AudioRingBuffer, Framebuffer, Key, Mailbox, Message, Notification};
use crate::config::ResetConfig;
use crate::cpu::{Cpu, Peripherals};
use crate::dma::DmaController;
use crate::error::EngineResult;
use crate::interrupt::Irq;
use crate::io_regs::IoRegs;
use crate::ppu::Ppu;
use crate::scheduler::Scheduler;
use crate::timer::Timers;
use crate::CYCLES_PER_FRAME;

const AUDIO_RING_CAPACITY_FRAMES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Run,
    Pause,
}

/// Handles shared with the frontend at `create()` time: the two mailboxes
/// and the two mutex-guarded buffers. Cloning is just `Arc::clone`.
#[derive(Clone)]
pub struct EngineHandles {
    pub messages: Arc<Mailbox<Message>>,
    pub notifications: Arc<Mailbox<Notification>>,
    pub framebuffer: Arc<Framebuffer>,
    pub audio_ring: Arc<AudioRingBuffer>,
    pub request_pause: Arc<AtomicBool>,
}

impl EngineHandles {
    /// Async-signal-safe: the only operation this struct exposes that a
    /// signal handler may call directly.
    pub fn request_pause(&self) {
        self.request_pause.store(true, Ordering::Release);
    }
}

pub struct Engine {
    cpu: Cpu,
    bus: Bus,
    io: IoRegs,
    dma: DmaController,
    timers: Timers,
    apu: Apu,
    ppu: Ppu,
    sched: Scheduler,

    handles: EngineHandles,
    state: RunState,
    exiting: bool,
    initialized: bool,
}

impl Engine {
    /// `create()`: allocates every subsystem and the shared resources the
    /// frontend needs handles to, but does not start running — the engine
    /// sits idle (no ROM loaded) until the frontend sends `RESET`.
    pub fn create() -> (Engine, EngineHandles) {
        let handles = EngineHandles {
            messages: Arc::new(Mailbox::new()),
            notifications: Arc::new(Mailbox::new()),
            framebuffer: Arc::new(Framebuffer::new(crate::SCREEN_WIDTH, crate::SCREEN_HEIGHT)),
            audio_ring: Arc::new(AudioRingBuffer::new(AUDIO_RING_CAPACITY_FRAMES)),
            request_pause: Arc::new(AtomicBool::new(false)),
        };

        let engine = Engine {
            cpu: Cpu::new(),
            bus: Bus::new(BackupKind::None, false),
            io: IoRegs::new(),
            dma: DmaController::new(),
            timers: Timers::new(),
            apu: Apu::new(),
            ppu: Ppu::new(),
            sched: Scheduler::new(),
            handles: handles.clone(),
            state: RunState::Pause,
            exiting: false,
            initialized: false,
        };

        (engine, handles)
    }

    fn peripherals(&mut self) -> Peripherals<'_> {
        Peripherals {
            bus: &mut self.bus,
            io: &mut self.io,
            dma: &mut self.dma,
            timers: &mut self.timers,
            apu: &mut self.apu,
            ppu: &mut self.ppu,
            sched: &mut self.sched,
            framebuffer: &self.handles.framebuffer,
            audio_ring: &self.handles.audio_ring,
        }
    }

    /// `run(engine)`: blocks the calling thread, implementing §4.8's loop
    /// verbatim. Returns once an `EXIT` message has been processed, or
    /// propagates a fatal `EngineError` (unknown opcode, scheduler livelock)
    /// up to whatever spawned the engine thread.
    pub fn run(&mut self) -> EngineResult<()> {
        loop {
            let drained = self.handles.messages.drain();
            for msg in drained {
                self.process_message(msg)?;
            }
            if self.exiting {
                return Ok(());
            }
            if self.state == RunState::Pause {
                self.handles.messages.wait_for_record();
                continue;
            }

            if self.handles.request_pause.swap(false, Ordering::AcqRel) {
                self.process_message(Message::Pause)?;
                continue;
            }

            if self.state == RunState::Run {
                self.run_for(CYCLES_PER_FRAME)?;
            }
        }
    }

    fn run_for(&mut self, cycles: u64) -> EngineResult<()> {
        let target = self.sched.cycles() + cycles;
        while self.sched.cycles() < target {
            let mut mem = self.peripherals();
            self.cpu.step(&mut mem)?;
        }
        Ok(())
    }

    fn process_message(&mut self, msg: Message) -> EngineResult<()> {
        match msg {
            Message::Exit => {
                self.exiting = true;
            }
            Message::Reset(cfg) => {
                self.reset(*cfg)?;
                self.handles.notifications.push(Notification::Reset);
            }
            Message::Run => {
                self.state = RunState::Run;
                self.handles.notifications.push(Notification::Run);
            }
            Message::Pause => {
                self.state = RunState::Pause;
                self.handles.notifications.push(Notification::Pause);
            }
            Message::Key { key, pressed } => {
                self.set_key(key, pressed);
            }
        }
        Ok(())
    }

    fn set_key(&mut self, key: Key, pressed: bool) {
        let bit = key.bit();
        let current = self.io.keyinput();
        // Active-low: a pressed key clears its bit.
        let updated = if pressed { current & !bit } else { current | bit };
        self.io.set_keyinput(updated);
        self.evaluate_keypad_irq();
    }

    fn evaluate_keypad_irq(&mut self) {
        let cnt = self.io.keycnt();
        if !cnt.irq_enabled() {
            return;
        }
        let mask = cnt.mask();
        let pressed = !self.io.keyinput() & mask;
        let condition_met = if cnt.require_all() { pressed == mask } else { pressed != 0 };
        if condition_met {
            self.io.raise_irq(Irq::Keypad);
        }
    }

    /// `RESET`: rebuilds every subsystem from scratch (per §4 "Lifecycles",
    /// a reset re-initialises scheduler, memory, I/O, PPU/APU/GPIO and the
    /// core) while leaving the mailboxes and shared buffers untouched —
    /// those outlive any number of resets.
    fn reset(&mut self, cfg: ResetConfig) -> EngineResult<()> {
        let cfg = cfg.sanitize()?;

        self.bus = Bus::new(cfg.backup_storage_type, cfg.rtc);
        self.bus.reset(&cfg.bios, &cfg.rom);
        if let Some(saved) = &cfg.backup {
            self.bus.backup.load(saved);
        }

        self.io = IoRegs::new();
        self.dma = DmaController::new();
        self.timers = Timers::new();
        self.apu = Apu::new();
        self.ppu = Ppu::new();
        self.sched = Scheduler::new();
        self.cpu = Cpu::new();

        self.apu.start_sequencer(&mut self.sched);
        self.apu.start_resampler(&mut self.sched, cfg.audio_frequency);
        self.ppu.start(&mut self.sched);

        {
            let mut mem = self.peripherals();
            if cfg.skip_bios {
                self.cpu.skip_bios_state(&mut mem);
            } else {
                self.cpu.reset(0, &mut mem);
            }
        }

        self.state = RunState::Pause;
        self.initialized = true;
        Ok(())
    }

    /// Serialises the full engine state per the quicksave format: core
    /// registers, memory regions, prefetch buffer, backup state, bus latch,
    /// I/O block (plus DMA/timer internal state riding along with it), PPU
    /// state, GPIO/RTC, APU state, then the scheduler's event table.
    pub fn quicksave(&self) -> Vec<u8> {
        let mut w = crate::quicksave::Writer::new();
        self.cpu.write_state(&mut w);
        self.bus.write_state(&mut w);
        self.io.write_state(&mut w);
        self.dma.write_state(&mut w);
        self.timers.write_state(&mut w);
        self.ppu.write_state(&mut w);
        self.bus.gpio.write_state(&mut w);
        self.apu.write_state(&mut w);
        self.sched.write_state(&mut w);
        w.into_bytes()
    }

    /// Restores a snapshot produced by `quicksave`. Per the error-handling
    /// design's "snapshot mismatch" rule, a malformed or foreign blob leaves
    /// the engine untouched: every subsystem is rebuilt into a scratch
    /// instance first, and only swapped into `self` once every section has
    /// parsed successfully.
    pub fn quickload(&mut self, data: &[u8]) -> EngineResult<()> {
        let mut r = crate::quicksave::Reader::new(data);

        let mut cpu = Cpu::new();
        cpu.read_state(&mut r)?;

        let mut bus = self.bus.fork_for_quickload();
        bus.read_state(&mut r)?;

        let mut io = IoRegs::new();
        io.read_state(&mut r)?;

        let mut dma = DmaController::new();
        dma.read_state(&mut r)?;

        let mut timers = Timers::new();
        timers.read_state(&mut r)?;

        let mut ppu = Ppu::new();
        ppu.read_state(&mut r)?;

        bus.gpio.read_state(&mut r)?;

        let mut apu = Apu::new();
        apu.read_state(&mut r)?;

        let mut sched = Scheduler::new();
        sched.read_state(&mut r)?;

        self.cpu = cpu;
        self.bus = bus;
        self.io = io;
        self.dma = dma;
        self.timers = timers;
        self.ppu = ppu;
        self.apu = apu;
        self.sched = sched;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom(bytes: usize) -> Vec<u8> {
        vec![0u8; bytes]
    }

    fn cfg() -> ResetConfig {
        ResetConfig {
            rom: rom(0x1000),
            bios: vec![0u8; 16 * 1024],
            skip_bios: true,
            audio_frequency: 32_768,
            rtc: false,
            backup_storage_type: BackupKind::None,
            backup: None,
            color_correction: false,
        }
    }

    #[test]
    fn create_starts_paused_with_no_pending_exit() {
        let (engine, _handles) = Engine::create();
        assert_eq!(engine.state, RunState::Pause);
        assert!(!engine.exiting);
    }

    #[test]
    fn reset_message_initialises_and_emits_notification() {
        let (mut engine, handles) = Engine::create();
        engine.process_message(Message::Reset(Box::new(cfg()))).unwrap();
        assert!(engine.initialized);
        assert_eq!(handles.notifications.drain(), vec![Notification::Reset]);
    }

    #[test]
    fn run_message_transitions_state_and_notifies() {
        let (mut engine, handles) = Engine::create();
        engine.process_message(Message::Reset(Box::new(cfg()))).unwrap();
        handles.notifications.drain();
        engine.process_message(Message::Run).unwrap();
        assert_eq!(engine.state, RunState::Run);
        assert_eq!(handles.notifications.drain(), vec![Notification::Run]);
    }

    #[test]
    fn pressing_a_key_clears_its_active_low_bit() {
        let (mut engine, _handles) = Engine::create();
        engine.process_message(Message::Reset(Box::new(cfg()))).unwrap();
        let before = engine.io.keyinput();
        engine.set_key(Key::A, true);
        assert_eq!(engine.io.keyinput(), before & !Key::A.bit());
        engine.set_key(Key::A, false);
        assert_eq!(engine.io.keyinput(), before);
    }

    #[test]
    fn exit_message_sets_exit_flag() {
        let (mut engine, _handles) = Engine::create();
        engine.process_message(Message::Exit).unwrap();
        assert!(engine.exiting);
    }

    #[test]
    fn run_for_one_frame_advances_scheduler_by_exactly_one_frame() {
        let (mut engine, _handles) = Engine::create();
        engine.process_message(Message::Reset(Box::new(cfg()))).unwrap();
        let before = engine.sched.cycles();
        engine.run_for(CYCLES_PER_FRAME).unwrap();
        assert!(engine.sched.cycles() >= before + CYCLES_PER_FRAME);
    }

    #[test]
    fn quicksave_then_quickload_restores_scheduler_cycles() {
        let (mut engine, _handles) = Engine::create();
        engine.process_message(Message::Reset(Box::new(cfg()))).unwrap();
        engine.run_for(1000).unwrap();
        let before = engine.sched.cycles();
        let regs_before = engine.cpu.reg(15);

        let blob = engine.quicksave();
        engine.run_for(1000).unwrap();
        assert_ne!(engine.sched.cycles(), before);

        engine.quickload(&blob).unwrap();
        assert_eq!(engine.sched.cycles(), before);
        assert_eq!(engine.cpu.reg(15), regs_before);
    }

    #[test]
    fn quickload_rejects_truncated_snapshot_without_mutating_engine() {
        let (mut engine, _handles) = Engine::create();
        engine.process_message(Message::Reset(Box::new(cfg()))).unwrap();
        let before = engine.sched.cycles();

        let err = engine.quickload(&[1, 2, 3]);
        assert!(err.is_err());
        assert_eq!(engine.sched.cycles(), before);
    }
}
