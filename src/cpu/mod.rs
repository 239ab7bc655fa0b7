//! ARM7TDMI core: register file (with the banked sets every privileged mode
//! needs), CPSR/SPSR, the three-stage pipeline abstraction, and `step()`,
//! which the rest of the engine drives once per instruction. Grounded on the
//! teacher's CPU module structure — a flat register array plus small typed
//! wrappers around the status word — generalised from x86 to ARM's banked
//! register sets and two instruction streams.

pub mod arm;
pub mod shifter;
pub mod thumb;

use lazy_static::lazy_static;

use crate::apu::Apu;
use crate::bus::{AccessType, Bus};
use crate::channel::{AudioRingBuffer, Framebuffer};
use crate::dma::DmaController;
use crate::error::{EngineError, EngineResult};
use crate::interrupt::{self, Irq};
use crate::io_regs::IoRegs;
use crate::mmio;
use crate::ppu::Ppu;
use crate::scheduler::{EventKind, Scheduler};
use crate::timer::Timers;

pub const MODE_USR: u32 = 0x10;
pub const MODE_FIQ: u32 = 0x11;
pub const MODE_IRQ: u32 = 0x12;
pub const MODE_SVC: u32 = 0x13;
pub const MODE_ABT: u32 = 0x17;
pub const MODE_UND: u32 = 0x1B;
pub const MODE_SYS: u32 = 0x1F;

pub const VEC_RESET: u32 = 0x0000_0000;
pub const VEC_UND: u32 = 0x0000_0004;
pub const VEC_SVC: u32 = 0x0000_0008;
pub const VEC_PREF_ABT: u32 = 0x0000_000C;
pub const VEC_DATA_ABT: u32 = 0x0000_0010;
pub const VEC_IRQ: u32 = 0x0000_0018;
pub const VEC_FIQ: u32 = 0x0000_001C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Run,
    Halt,
    Stop,
}

/// CPSR/SPSR as a raw 32-bit word with named-bit accessors, per the "Packed
/// bitfields" design note used everywhere else in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cpsr(pub u32);

impl Cpsr {
    pub fn mode(&self) -> u32 {
        self.0 & 0x1F
    }
    pub fn set_mode(&mut self, mode: u32) {
        self.0 = (self.0 & !0x1F) | (mode & 0x1F);
    }
    pub fn thumb(&self) -> bool {
        (self.0 >> 5) & 1 != 0
    }
    pub fn set_thumb(&mut self, v: bool) {
        self.set_bit(5, v);
    }
    pub fn fiq_disable(&self) -> bool {
        (self.0 >> 6) & 1 != 0
    }
    pub fn set_fiq_disable(&mut self, v: bool) {
        self.set_bit(6, v);
    }
    pub fn irq_disable(&self) -> bool {
        (self.0 >> 7) & 1 != 0
    }
    pub fn set_irq_disable(&mut self, v: bool) {
        self.set_bit(7, v);
    }
    pub fn overflow(&self) -> bool {
        (self.0 >> 28) & 1 != 0
    }
    pub fn set_overflow(&mut self, v: bool) {
        self.set_bit(28, v);
    }
    pub fn carry(&self) -> bool {
        (self.0 >> 29) & 1 != 0
    }
    pub fn set_carry(&mut self, v: bool) {
        self.set_bit(29, v);
    }
    pub fn zero(&self) -> bool {
        (self.0 >> 30) & 1 != 0
    }
    pub fn set_zero(&mut self, v: bool) {
        self.set_bit(30, v);
    }
    pub fn negative(&self) -> bool {
        (self.0 >> 31) & 1 != 0
    }
    pub fn set_negative(&mut self, v: bool) {
        self.set_bit(31, v);
    }
    pub fn flags_nibble(&self) -> u32 {
        self.0 >> 28
    }

    fn set_bit(&mut self, bit: u32, v: bool) {
        if v {
            self.0 |= 1 << bit;
        } else {
            self.0 &= !(1 << bit);
        }
    }

    pub fn set_nzcv(&mut self, n: bool, z: bool, c: bool, v: bool) {
        self.set_negative(n);
        self.set_zero(z);
        self.set_carry(c);
        self.set_overflow(v);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BankedLoHi {
    r13: u32,
    r14: u32,
}

/// The banked register sets every privileged mode needs: FIQ banks r8..r14,
/// every other privileged mode banks only r13/r14 (r8..r12 are shared by
/// Sys/Usr, stashed here only while the core is actually in FIQ mode).
struct Banks {
    // fiq, irq, svc, abt, und, usr/sys
    lohi: [BankedLoHi; 6],
    fiq_r8_12: [u32; 5],
    usr_r8_12: [u32; 5],
    // fiq, irq, svc, abt, und
    spsr: [u32; 5],
}

impl Banks {
    fn new() -> Self {
        Banks { lohi: [BankedLoHi::default(); 6], fiq_r8_12: [0; 5], usr_r8_12: [0; 5], spsr: [0; 5] }
    }
}

fn bank_index(mode: u32) -> usize {
    match mode {
        MODE_FIQ => 0,
        MODE_IRQ => 1,
        MODE_SVC => 2,
        MODE_ABT => 3,
        MODE_UND => 4,
        _ => 5,
    }
}

fn spsr_index(mode: u32) -> usize {
    match mode {
        MODE_FIQ => 0,
        MODE_IRQ => 1,
        MODE_SVC => 2,
        MODE_ABT => 3,
        MODE_UND => 4,
        _ => unreachable!("USR/SYS have no SPSR"),
    }
}

fn lr_offset(vector: u32, thumb: bool) -> Option<u32> {
    match vector {
        VEC_RESET => None,
        VEC_SVC | VEC_UND => Some(if thumb { 2 } else { 4 }),
        _ => Some(if thumb { 0 } else { 4 }),
    }
}

/// 256-entry condition-code lookup, indexed by `(flags_nibble << 4) | cond`,
/// built once. `cond == 0xF` ("NV") is always false on this architecture
/// revision.
struct CondLut([bool; 256]);

lazy_static! {
    static ref COND_LUT: CondLut = {
        let mut table = [false; 256];
        for flags in 0..16u32 {
            let n = (flags >> 3) & 1 != 0;
            let z = (flags >> 2) & 1 != 0;
            let c = (flags >> 1) & 1 != 0;
            let v = flags & 1 != 0;
            for cond in 0..16u32 {
                let result = match cond {
                    0x0 => z,
                    0x1 => !z,
                    0x2 => c,
                    0x3 => !c,
                    0x4 => n,
                    0x5 => !n,
                    0x6 => v,
                    0x7 => !v,
                    0x8 => c && !z,
                    0x9 => !c || z,
                    0xA => n == v,
                    0xB => n != v,
                    0xC => !z && (n == v),
                    0xD => z || (n != v),
                    0xE => true,
                    _ => false,
                };
                table[((flags << 4) | cond) as usize] = result;
            }
        }
        CondLut(table)
    };
}

pub fn eval_cond(flags_nibble: u32, cond: u32) -> bool {
    COND_LUT.0[((flags_nibble << 4) | (cond & 0xF)) as usize]
}

/// Every sibling subsystem `Cpu::step` touches for a single instruction,
/// bundled so call sites don't carry a six-argument signature. No subsystem
/// here holds a reference to another; `Engine` constructs this fresh out of
/// its own disjoint fields each call.
pub struct Peripherals<'a> {
    pub bus: &'a mut Bus,
    pub io: &'a mut IoRegs,
    pub dma: &'a mut DmaController,
    pub timers: &'a mut Timers,
    pub apu: &'a mut Apu,
    pub ppu: &'a mut Ppu,
    pub sched: &'a mut Scheduler,
    pub framebuffer: &'a Framebuffer,
    pub audio_ring: &'a AudioRingBuffer,
}

impl<'a> Peripherals<'a> {
    fn waitcnt(&self) -> crate::io_regs::WaitCnt {
        self.io.waitcnt()
    }

    pub fn read8(&mut self, addr: u32, access: AccessType) -> (u8, u32) {
        if mmio::in_window(addr) {
            let mut r = mmio::MmioRefs {
                io: &mut *self.io,
                dma: &mut *self.dma,
                timers: &mut *self.timers,
                apu: &mut *self.apu,
                sched: &mut *self.sched,
            };
            (mmio::read8(self.bus, &mut r, addr), 1)
        } else {
            self.bus.read8(addr, access, self.waitcnt())
        }
    }

    pub fn write8(&mut self, addr: u32, val: u8, access: AccessType) -> u32 {
        let _ = access;
        if mmio::in_window(addr) {
            let mut r = mmio::MmioRefs {
                io: &mut *self.io,
                dma: &mut *self.dma,
                timers: &mut *self.timers,
                apu: &mut *self.apu,
                sched: &mut *self.sched,
            };
            mmio::write8(self.bus, &mut r, addr, val);
            1
        } else {
            self.bus.write8(addr, val, self.waitcnt())
        }
    }

    pub fn read16(&mut self, addr: u32, access: AccessType) -> (u16, u32) {
        if mmio::in_window(addr) {
            let mut r = mmio::MmioRefs {
                io: &mut *self.io,
                dma: &mut *self.dma,
                timers: &mut *self.timers,
                apu: &mut *self.apu,
                sched: &mut *self.sched,
            };
            (mmio::read16(self.bus, &mut r, addr), 1)
        } else {
            self.bus.read16(addr, access, self.waitcnt())
        }
    }

    pub fn write16(&mut self, addr: u32, val: u16, access: AccessType) -> u32 {
        let _ = access;
        if mmio::in_window(addr) {
            let mut r = mmio::MmioRefs {
                io: &mut *self.io,
                dma: &mut *self.dma,
                timers: &mut *self.timers,
                apu: &mut *self.apu,
                sched: &mut *self.sched,
            };
            mmio::write16(self.bus, &mut r, addr, val);
            1
        } else {
            self.bus.write16(addr, val, self.waitcnt())
        }
    }

    pub fn read32(&mut self, addr: u32, access: AccessType) -> (u32, u32) {
        if mmio::in_window(addr) {
            let mut r = mmio::MmioRefs {
                io: &mut *self.io,
                dma: &mut *self.dma,
                timers: &mut *self.timers,
                apu: &mut *self.apu,
                sched: &mut *self.sched,
            };
            (mmio::read32(self.bus, &mut r, addr), 1)
        } else {
            self.bus.read32(addr, access, self.waitcnt())
        }
    }

    pub fn write32(&mut self, addr: u32, val: u32, access: AccessType) -> u32 {
        let _ = access;
        if mmio::in_window(addr) {
            let mut r = mmio::MmioRefs {
                io: &mut *self.io,
                dma: &mut *self.dma,
                timers: &mut *self.timers,
                apu: &mut *self.apu,
                sched: &mut *self.sched,
            };
            mmio::write32(self.bus, &mut r, addr, val);
            1
        } else {
            self.bus.write32(addr, val, self.waitcnt())
        }
    }

    /// Drains every scheduler event due at the current cycle, dispatching to
    /// whichever subsystem owns that `EventKind`. Called from `Cpu::idle`.
    pub fn drain_scheduler(&mut self) {
        while let Some((firing, delay)) = self.sched.pop_due() {
            match firing.kind {
                EventKind::PpuHDraw => {
                    self.ppu.on_hdraw(self.io, self.dma, self.sched, self.framebuffer);
                }
                EventKind::PpuHBlank => {
                    self.ppu.on_hblank(self.io, self.bus, self.dma, self.sched);
                }
                EventKind::TimerOverflow => {
                    let idx = firing.args.words[0] as usize;
                    let feeds_apu = self.timers.on_overflow(idx, self.io);
                    if feeds_apu {
                        self.apu.on_timer_overflow(idx, self.io, self.dma, self.sched);
                    }
                }
                EventKind::TimerStop => {
                    let idx = firing.args.words[0] as usize;
                    self.timers.on_stop_fired(idx, self.sched);
                }
                EventKind::DmaArm => {
                    let ch = firing.args.words[0] as usize;
                    self.dma.on_arm_fired(ch);
                }
                EventKind::ApuSample => {
                    if firing.args.words[0] == 0 {
                        self.apu.on_sequencer_tick();
                    } else {
                        self.apu.on_resample_tick(self.io, self.audio_ring);
                    }
                }
            }
            self.sched.restore(delay);
        }
    }
}

pub struct Cpu {
    regs: [u32; 16],
    cpsr: Cpsr,
    banks: Banks,
    prefetch: [u32; 2],
    next_access: AccessType,
    state: CoreState,
}

impl Cpu {
    pub fn new() -> Self {
        Cpu {
            regs: [0; 16],
            cpsr: Cpsr(MODE_SYS),
            banks: Banks::new(),
            prefetch: [0; 2],
            next_access: AccessType::NonSequential,
            state: CoreState::Run,
        }
    }

    pub fn reset(&mut self, entry: u32, mem: &mut Peripherals) {
        self.regs = [0; 16];
        self.cpsr = Cpsr(MODE_SYS);
        self.banks = Banks::new();
        self.state = CoreState::Run;
        self.regs[15] = entry;
        self.reload_pipeline(mem);
    }

    pub fn reg(&self, n: usize) -> u32 {
        self.regs[n]
    }
    pub fn set_reg(&mut self, n: usize, val: u32) {
        self.regs[n] = val;
    }
    pub fn pc(&self) -> u32 {
        self.regs[15]
    }
    pub fn cpsr(&self) -> Cpsr {
        self.cpsr
    }
    pub fn state(&self) -> CoreState {
        self.state
    }

    pub fn spsr(&self) -> u32 {
        let mode = self.cpsr.mode();
        if mode == MODE_USR || mode == MODE_SYS {
            self.cpsr.0
        } else {
            self.banks.spsr[spsr_index(mode)]
        }
    }

    pub fn set_spsr_raw(&mut self, val: u32) {
        let mode = self.cpsr.mode();
        if mode != MODE_USR && mode != MODE_SYS {
            self.banks.spsr[spsr_index(mode)] = val;
        }
    }

    fn set_spsr_on_entry(&mut self, val: Cpsr) {
        let mode = self.cpsr.mode();
        if mode != MODE_USR && mode != MODE_SYS {
            self.banks.spsr[spsr_index(mode)] = val.0;
        }
    }

    /// Restores CPSR from the current mode's SPSR (used by data-processing
    /// instructions writing to PC with the `S` bit set, and by `MOVS PC,LR`
    /// exception returns).
    pub fn restore_cpsr_from_spsr(&mut self) {
        let val = self.spsr();
        self.set_cpsr_full(Cpsr(val));
    }

    fn set_cpsr_full(&mut self, new: Cpsr) {
        let new_mode = new.mode();
        if new_mode != self.cpsr.mode() {
            self.switch_mode(new_mode);
        }
        self.cpsr = new;
    }

    /// MSR writes: `f`/`s`/`x`/`c` field masks select which bytes of CPSR/SPSR
    /// are affected. The control byte (mode + T + disables) is only writable
    /// from a privileged mode, and `T` is never writable this way — the
    /// architecture only changes instruction state via `BX`/exception entry.
    pub fn msr(&mut self, to_spsr: bool, field_mask: u32, val: u32) {
        let mut mask: u32 = 0;
        if field_mask & 0b0001 != 0 {
            mask |= 0x0000_00FF;
        }
        if field_mask & 0b0010 != 0 {
            mask |= 0x0000_FF00;
        }
        if field_mask & 0b0100 != 0 {
            mask |= 0x00FF_0000;
        }
        if field_mask & 0b1000 != 0 {
            mask |= 0xFF00_0000;
        }

        if to_spsr {
            let mode = self.cpsr.mode();
            if mode != MODE_USR && mode != MODE_SYS {
                let cur = self.banks.spsr[spsr_index(mode)];
                self.banks.spsr[spsr_index(mode)] = (cur & !mask) | (val & mask);
            }
            return;
        }

        let privileged = self.cpsr.mode() != MODE_USR;
        let mut effective_mask = mask & 0xFF00_0000;
        if privileged {
            effective_mask |= mask & 0x0000_00FF & !0x20; // never touch T via MSR
        }
        let new_mode = if effective_mask & 0x1F != 0 { val & 0x1F } else { self.cpsr.mode() };
        let new_raw = (self.cpsr.0 & !effective_mask) | (val & effective_mask);
        if new_mode != self.cpsr.mode() {
            self.switch_mode(new_mode);
        }
        self.cpsr.0 = (new_raw & !0x1F) | new_mode;
    }

    fn switch_mode(&mut self, new_mode: u32) {
        let old_mode = self.cpsr.mode();
        if old_mode == new_mode {
            return;
        }
        let old_is_fiq = old_mode == MODE_FIQ;
        let new_is_fiq = new_mode == MODE_FIQ;

        if old_is_fiq != new_is_fiq {
            if old_is_fiq {
                self.banks.fiq_r8_12.copy_from_slice(&self.regs[8..13]);
                self.regs[8..13].copy_from_slice(&self.banks.usr_r8_12);
            } else {
                self.banks.usr_r8_12.copy_from_slice(&self.regs[8..13]);
                self.regs[8..13].copy_from_slice(&self.banks.fiq_r8_12);
            }
        }

        let old_idx = bank_index(old_mode);
        self.banks.lohi[old_idx] = BankedLoHi { r13: self.regs[13], r14: self.regs[14] };
        let new_idx = bank_index(new_mode);
        let lohi = self.banks.lohi[new_idx];
        self.regs[13] = lohi.r13;
        self.regs[14] = lohi.r14;

        self.cpsr.set_mode(new_mode);
    }

    /// Saves CPSR to the target mode's SPSR, switches mode, sets LR per the
    /// vector's offset rule, masks interrupts, forces ARM state, and reloads
    /// the pipeline at `vector`. The two pipeline reads' cycle cost is
    /// charged to the scheduler by `reload_pipeline` itself.
    pub fn enter_exception(&mut self, vector: u32, mode: u32, mem: &mut Peripherals) {
        let thumb = self.cpsr.thumb();
        let old_cpsr = self.cpsr;
        let return_pc = self.regs[15];

        self.switch_mode(mode);
        self.set_spsr_on_entry(old_cpsr);

        if let Some(off) = lr_offset(vector, thumb) {
            self.regs[14] = return_pc.wrapping_sub(off);
        }

        self.cpsr.set_irq_disable(true);
        if vector == VEC_FIQ {
            self.cpsr.set_fiq_disable(true);
        }
        self.cpsr.set_thumb(false);
        self.regs[15] = vector;
        self.reload_pipeline(mem);
    }

    /// Refetches both prefetch slots at the current `PC` and charges their
    /// real bus cost to the scheduler via `idle`, instead of leaving the
    /// caller to discard it. Every PC write (branch, exception entry, reset)
    /// goes through this, so every pipeline refill actually costs cycles.
    fn reload_pipeline(&mut self, mem: &mut Peripherals) {
        let thumb = self.cpsr.thumb();
        self.regs[15] &= if thumb { !1 } else { !3 };
        let step = if thumb { 2 } else { 4 };

        let (first, c0) = if thumb {
            let (v, c) = mem.read16(self.regs[15], AccessType::NonSequential);
            (v as u32, c)
        } else {
            mem.read32(self.regs[15], AccessType::NonSequential)
        };
        self.prefetch[0] = first;
        self.regs[15] = self.regs[15].wrapping_add(step);

        let (second, c1) = if thumb {
            let (v, c) = mem.read16(self.regs[15], AccessType::Sequential);
            (v as u32, c)
        } else {
            mem.read32(self.regs[15], AccessType::Sequential)
        };
        self.prefetch[1] = second;
        self.regs[15] = self.regs[15].wrapping_add(step);
        self.next_access = AccessType::Sequential;

        self.idle(c0 as u64 + c1 as u64, mem);
    }

    /// Advances the cycle counter by `n`, runs pending DMA if flagged and not
    /// already running, ticks the cartridge prefetch buffer (only when the
    /// gamepak bus is free and no DMA is running), steps APU channel
    /// frequency timers, and drains scheduler events if due.
    pub fn idle(&mut self, n: u64, mem: &mut Peripherals) {
        mem.sched.advance(n);
        mem.apu.step(n as u32);

        if mem.dma.pending_any() && !mem.dma.is_running() {
            let waitcnt = mem.io.waitcnt();
            let vcount = mem.io.vcount();
            mem.dma.run_pending(mem.bus, mem.io, mem.apu, waitcnt, vcount);
        }

        if !mem.bus.gamepak_bus_in_use && !mem.dma.is_running() {
            let waitcnt = mem.io.waitcnt();
            mem.bus.step_prefetch(n as u32, waitcnt);
        }

        if mem.sched.due() {
            mem.drain_scheduler();
        }
    }

    /// IRQ gate + state dispatch + one instruction, per §4.2. Returns the
    /// number of cycles this step advanced.
    pub fn step(&mut self, mem: &mut Peripherals) -> EngineResult<u64> {
        let before = mem.sched.cycles();
        let ie = mem.io.ie();
        let iflag = mem.io.iflag();
        let irq_line = (ie & iflag) != 0;

        match self.state {
            CoreState::Run => {
                if interrupt::line_asserted(ie, iflag, mem.io.ime(), self.cpsr.irq_disable()) {
                    self.enter_exception(VEC_IRQ, MODE_IRQ, mem);
                }
            }
            CoreState::Halt => {
                // HALT resumes on any enabled, pending IRQ regardless of IME
                // or CPSR.I — those only gate whether the handler actually runs.
                if irq_line {
                    self.state = CoreState::Run;
                }
            }
            CoreState::Stop => {
                if iflag & Irq::Keypad.bit() != 0 {
                    self.state = CoreState::Run;
                }
            }
        }

        #[cfg(feature = "debugger")]
        self.check_breakpoint();

        match self.state {
            CoreState::Run => self.execute_one(mem)?,
            CoreState::Halt | CoreState::Stop => self.idle(1, mem),
        }

        if let Some(halt_req) = mem.io.take_halt_request() {
            self.state = if halt_req == 0 { CoreState::Halt } else { CoreState::Stop };
        }

        let advanced = mem.sched.cycles() - before;
        Scheduler::check_progress(advanced, self.state != CoreState::Run)?;
        Ok(advanced)
    }

    /// Hook point for a disassembling debugger REPL to inspect `self.regs[15]`
    /// before an instruction executes. A no-op here; a frontend that wants to
    /// stop on a breakpoint does so by not calling `step` again, not by this
    /// function returning anything. Compiled out entirely without the
    /// `debugger` feature, so it never affects cycle counts either way.
    #[cfg(feature = "debugger")]
    fn check_breakpoint(&self) {}

    fn execute_one(&mut self, mem: &mut Peripherals) -> EngineResult<()> {
        if self.cpsr.thumb() {
            let opcode = self.prefetch[0] as u16;
            self.prefetch[0] = self.prefetch[1];
            let access = self.next_access;
            let (next, cycles) = mem.read16(self.regs[15], access);
            self.prefetch[1] = next as u32;
            self.regs[15] = self.regs[15].wrapping_add(2);
            self.next_access = AccessType::Sequential;
            self.idle(cycles as u64, mem);
            thumb::execute(self, opcode, mem)?;
        } else {
            let opcode = self.prefetch[0];
            let cond = opcode >> 28;
            if !eval_cond(self.cpsr.flags_nibble(), cond) {
                self.prefetch[0] = self.prefetch[1];
                let (next, cycles) = mem.read32(self.regs[15], AccessType::Sequential);
                self.prefetch[1] = next;
                self.regs[15] = self.regs[15].wrapping_add(4);
                self.next_access = AccessType::Sequential;
                self.idle(cycles as u64, mem);
                return Ok(());
            }
            self.prefetch[0] = self.prefetch[1];
            let access = self.next_access;
            let (next, cycles) = mem.read32(self.regs[15], access);
            self.prefetch[1] = next;
            self.regs[15] = self.regs[15].wrapping_add(4);
            self.next_access = AccessType::Sequential;
            self.idle(cycles as u64, mem);
            arm::execute(self, opcode, mem)?;
        }
        Ok(())
    }

    /// Called by a taken branch / any other PC write: reloads the pipeline
    /// and resets the access-type tracker.
    pub fn branch_to(&mut self, target: u32, mem: &mut Peripherals) {
        self.regs[15] = target;
        self.reload_pipeline(mem);
    }

    /// `BX`: the target's bit 0 selects Thumb state.
    pub fn branch_exchange(&mut self, target: u32, mem: &mut Peripherals) {
        let thumb = target & 1 != 0;
        self.cpsr.set_thumb(thumb);
        self.branch_to(target, mem);
    }

    pub fn unknown_opcode(&self, isa: &'static str, opcode: u32) -> EngineError {
        EngineError::UnknownOpcode { isa, opcode, pc: self.regs[15] }
    }

    /// For `STR`/`STM` of PC-relative loads: PC reads as the address of the
    /// instruction after next (since `PC` always sits two slots ahead).
    pub fn pc_for_read(&self) -> u32 {
        self.regs[15]
    }

    /// Seeds the banked stack pointers and CPSR the BIOS's reset handler
    /// would otherwise have left behind, for a `skip_bios` reset: entry is
    /// the cartridge's ROM header entry point rather than vector 0.
    pub fn skip_bios_state(&mut self, mem: &mut Peripherals) {
        self.switch_mode(MODE_SVC);
        self.regs[13] = 0x0300_7FE0;
        self.switch_mode(MODE_IRQ);
        self.regs[13] = 0x0300_7FA0;
        self.switch_mode(MODE_SYS);
        self.regs[13] = 0x0300_7F00;
        self.cpsr = Cpsr(MODE_SYS);
        self.regs[15] = 0x0800_0000;
        self.reload_pipeline(mem);
    }

    /// Appends the "core registers" quicksave section: register file, CPSR,
    /// every banked set, and the pipeline's two prefetched opcodes.
    pub fn write_state(&self, w: &mut crate::quicksave::Writer) {
        for r in self.regs {
            w.u32(r);
        }
        w.u32(self.cpsr.0);
        for lh in self.banks.lohi {
            w.u32(lh.r13);
            w.u32(lh.r14);
        }
        for r in self.banks.fiq_r8_12 {
            w.u32(r);
        }
        for r in self.banks.usr_r8_12 {
            w.u32(r);
        }
        for s in self.banks.spsr {
            w.u32(s);
        }
        w.u32(self.prefetch[0]);
        w.u32(self.prefetch[1]);
        w.bool(self.next_access.is_sequential());
        w.u8(match self.state {
            CoreState::Run => 0,
            CoreState::Halt => 1,
            CoreState::Stop => 2,
        });
    }

    pub fn read_state(&mut self, r: &mut crate::quicksave::Reader) -> EngineResult<()> {
        for slot in self.regs.iter_mut() {
            *slot = r.u32()?;
        }
        self.cpsr = Cpsr(r.u32()?);
        for lh in self.banks.lohi.iter_mut() {
            lh.r13 = r.u32()?;
            lh.r14 = r.u32()?;
        }
        for slot in self.banks.fiq_r8_12.iter_mut() {
            *slot = r.u32()?;
        }
        for slot in self.banks.usr_r8_12.iter_mut() {
            *slot = r.u32()?;
        }
        for slot in self.banks.spsr.iter_mut() {
            *slot = r.u32()?;
        }
        self.prefetch[0] = r.u32()?;
        self.prefetch[1] = r.u32()?;
        self.next_access = if r.bool()? { AccessType::Sequential } else { AccessType::NonSequential };
        self.state = match r.u8()? {
            1 => CoreState::Halt,
            2 => CoreState::Stop,
            _ => CoreState::Run,
        };
        Ok(())
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cond_lut_eq_true_only_when_zero_set() {
        assert!(eval_cond(0b0100, 0x0));
        assert!(!eval_cond(0b0000, 0x0));
    }

    #[test]
    fn cond_lut_al_is_always_true() {
        for flags in 0..16u32 {
            assert!(eval_cond(flags, 0xE));
        }
    }

    #[test]
    fn cond_lut_nv_is_always_false() {
        for flags in 0..16u32 {
            assert!(!eval_cond(flags, 0xF));
        }
    }

    #[test]
    fn switch_mode_preserves_fiq_r8_12_separately_from_usr() {
        let mut cpu = Cpu::new();
        cpu.regs[8] = 0x1111;
        cpu.regs[13] = 0xAAAA;
        cpu.switch_mode(MODE_FIQ);
        cpu.regs[8] = 0x2222;
        cpu.regs[13] = 0xBBBB;
        cpu.switch_mode(MODE_SYS);
        assert_eq!(cpu.regs[8], 0x1111);
        assert_eq!(cpu.regs[13], 0xAAAA);
        cpu.switch_mode(MODE_FIQ);
        assert_eq!(cpu.regs[8], 0x2222);
        assert_eq!(cpu.regs[13], 0xBBBB);
    }

    #[test]
    fn switch_mode_irq_only_banks_r13_r14() {
        let mut cpu = Cpu::new();
        cpu.regs[12] = 0x5555;
        cpu.switch_mode(MODE_IRQ);
        assert_eq!(cpu.regs[12], 0x5555);
    }

    #[test]
    fn lr_offset_svc_is_size_of_instruction() {
        assert_eq!(lr_offset(VEC_SVC, false), Some(4));
        assert_eq!(lr_offset(VEC_SVC, true), Some(2));
    }

    #[test]
    fn lr_offset_irq_is_constant_4_regardless_of_interrupted_state() {
        assert_eq!(lr_offset(VEC_IRQ, false), Some(4));
        assert_eq!(lr_offset(VEC_IRQ, true), Some(0));
    }

    #[test]
    fn lr_offset_reset_writes_nothing() {
        assert_eq!(lr_offset(VEC_RESET, false), None);
    }
}
