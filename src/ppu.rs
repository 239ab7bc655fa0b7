//! Line-based PPU rasteriser, driven by two recurring scheduler events
//! (`HDraw`, `HBlank`) exactly the way the timer/DMA subsystems are driven —
//! no subsystem owns the PPU, `Cpu::idle`'s scheduler drain calls into it with
//! borrowed references to whatever it needs for that one callback.
//!
//! Grounded on the reference renderer's per-priority merge pipeline: a
//! backdrop layer, four BG layers (text or affine depending on `DISPCNT`
//! mode), four OAM priority buckets, composited back-to-front through
//! `merge_layer` with window masking and BLDCNT blending applied at each step.

use crate::bus::Bus;
use crate::channel::Framebuffer;
use crate::dma::{DmaController, DmaTiming};
use crate::interrupt::Irq;
use crate::io_regs::{BlendMode, IoRegs};
use crate::scheduler::{EventArgs, EventKind, Scheduler};
use crate::{CYCLES_PER_PIXEL, SCREEN_HEIGHT, SCREEN_WIDTH};

const DOTS_PER_LINE: u64 = 308;
const HDRAW_PERIOD: u64 = CYCLES_PER_PIXEL * DOTS_PER_LINE;
const HBLANK_OFFSET: u64 = CYCLES_PER_PIXEL * 240 + 46;
const TOTAL_LINES: u16 = 228;

const OBJ_TILE_BASE: usize = 0x1_0000;

/// One compositor layer slot: a 15-bit BGR colour plus visibility, enough
/// state for `merge_layer` to decide whether this pixel participates.
#[derive(Clone, Copy, Default)]
struct Pixel {
    color: u16,
    visible: bool,
    force_blend: bool,
}

#[derive(Clone, Copy, Default)]
struct AffineLatch {
    x: i32,
    y: i32,
}

struct Sprite {
    y: i32,
    x: i32,
    width: i32,
    height: i32,
    tile: u32,
    palette: u8,
    depth8: bool,
    h_flip: bool,
    v_flip: bool,
    priority: u8,
    mode: u8, // 0 normal, 1 semi-transparent, 2 obj window
    mosaic: bool,
}

pub struct Ppu {
    output: Vec<u32>,
    affine: [AffineLatch; 2],
    vcount: u16,
    frame_count: u64,
    in_vblank: bool,
}

impl Ppu {
    pub fn new() -> Self {
        Ppu {
            output: vec![0xFF00_0000; SCREEN_WIDTH * SCREEN_HEIGHT],
            affine: [AffineLatch::default(); 2],
            vcount: 0,
            frame_count: 0,
            in_vblank: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// "PPU state" quicksave section: the composited output buffer (so a
    /// restore is visible immediately, without waiting for the next VBlank
    /// copy), the per-background affine latches, and the scanline/frame
    /// counters.
    pub fn write_state(&self, w: &mut crate::quicksave::Writer) {
        for &px in &self.output {
            w.u32(px);
        }
        for a in &self.affine {
            w.u32(a.x as u32);
            w.u32(a.y as u32);
        }
        w.u16(self.vcount);
        w.u64(self.frame_count);
        w.bool(self.in_vblank);
    }

    pub fn read_state(&mut self, r: &mut crate::quicksave::Reader) -> crate::error::EngineResult<()> {
        for px in self.output.iter_mut() {
            *px = r.u32()?;
        }
        for a in self.affine.iter_mut() {
            a.x = r.u32()? as i32;
            a.y = r.u32()? as i32;
        }
        self.vcount = r.u16()?;
        self.frame_count = r.u64()?;
        self.in_vblank = r.bool()?;
        Ok(())
    }

    /// Arms the two recurring scanline events; called once by `Engine::reset`.
    pub fn start(&mut self, sched: &mut Scheduler) {
        sched.add(sched.cycles() + HDRAW_PERIOD, true, HDRAW_PERIOD, EventKind::PpuHDraw, EventArgs::none());
        sched.add(sched.cycles() + HBLANK_OFFSET, true, HDRAW_PERIOD, EventKind::PpuHBlank, EventArgs::none());
    }

    /// Fired every scanline boundary (`CYCLES_PER_PIXEL * 308`).
    pub fn on_hdraw(&mut self, io: &mut IoRegs, dma: &mut DmaController, sched: &mut Scheduler, framebuffer: &Framebuffer) {
        self.vcount = (self.vcount + 1) % TOTAL_LINES;
        if self.vcount == 0 {
            self.frame_count += 1;
            self.affine[0] = AffineLatch { x: io.bg_affine_ref(true).0, y: io.bg_affine_ref(true).1 };
            self.affine[1] = AffineLatch { x: io.bg_affine_ref(false).0, y: io.bg_affine_ref(false).1 };
        }
        io.set_vcount(self.vcount);

        let vcount_eq = self.vcount as u8 == io.dispstat().vcount_target();
        let entering_vblank = self.vcount == SCREEN_HEIGHT as u16;
        self.in_vblank = self.vcount >= SCREEN_HEIGHT as u16;
        io.set_dispstat_flags(self.in_vblank, false, vcount_eq);

        if entering_vblank {
            framebuffer.copy_from(&self.output);
            if io.dispstat().vblank_irq_enable() {
                io.raise_irq(Irq::VBlank);
            }
            dma.schedule_all(DmaTiming::VBlank, sched);
        }
        if vcount_eq && io.dispstat().vcount_irq_enable() {
            io.raise_irq(Irq::VCounter);
        }
    }

    /// Fired `CYCLES_PER_PIXEL * 240 + 46` into each line: the visible area
    /// for this scanline is already in VRAM, so this is where rendering and
    /// the HBlank-timed housekeeping happen together.
    pub fn on_hblank(&mut self, io: &mut IoRegs, bus: &mut Bus, dma: &mut DmaController, sched: &mut Scheduler) {
        if self.vcount < SCREEN_HEIGHT as u16 {
            self.render_scanline(io, bus, self.vcount as usize);
        }

        let vcount_eq = self.vcount as u8 == io.dispstat().vcount_target();
        io.set_dispstat_flags(self.in_vblank, true, vcount_eq);
        if io.dispstat().hblank_irq_enable() {
            io.raise_irq(Irq::HBlank);
        }
        dma.schedule_all(DmaTiming::HBlank, sched);

        if (2..SCREEN_HEIGHT as u16 + 1).contains(&self.vcount) {
            dma.schedule_for(3, DmaTiming::Special, sched);
        }

        for bg in 0..2 {
            // refX/refY advance by (PB, PD) per scanline; (PA, PC) instead
            // drive the per-pixel step within a line, in `render_affine_bg`.
            let (_, pb, _, pd) = io.bg_affine_params(bg == 0);
            self.affine[bg].x = self.affine[bg].x.wrapping_add(pb as i32);
            self.affine[bg].y = self.affine[bg].y.wrapping_add(pd as i32);
        }
    }

    fn render_scanline(&mut self, io: &IoRegs, bus: &Bus, line: usize) {
        let dispcnt = io.dispcnt();
        let row_base = line * SCREEN_WIDTH;

        if dispcnt.forced_blank() {
            for x in 0..SCREEN_WIDTH {
                self.output[row_base + x] = expand_color(0x7FFF, false);
            }
            return;
        }

        let backdrop = read_palette(bus, 0, 0);
        let mut result = vec![Pixel { color: backdrop, visible: true, force_blend: false }; SCREEN_WIDTH];

        let sprites = self.gather_sprites(bus, line);

        let mode = dispcnt.bg_mode();
        let mut bg_lines: [Option<Vec<Pixel>>; 4] = [None, None, None, None];
        for bg in 0..4 {
            if !dispcnt.bg_enabled(bg) {
                continue;
            }
            let enabled_in_mode = match mode {
                0 => true,
                1 => bg <= 2,
                2 => bg >= 2,
                3 | 4 | 5 => bg == 2,
                _ => false,
            };
            if !enabled_in_mode {
                continue;
            }
            bg_lines[bg] = Some(match mode {
                0 => self.render_text_bg(io, bus, bg, line),
                1 | 2 if bg < 2 => self.render_text_bg(io, bus, bg, line),
                1 | 2 => self.render_affine_bg(io, bus, bg, line),
                3 => self.render_bitmap_mode3(bus, line),
                4 => self.render_bitmap_mode4(io, bus, line),
                5 => self.render_bitmap_mode5(io, bus, line),
                _ => vec![Pixel::default(); SCREEN_WIDTH],
            });
        }

        let bldcnt = io.bldcnt();
        let (eva, evb) = io.bldalpha();
        let evy = io.bldy();
        let windows_active = dispcnt.win0_enabled() || dispcnt.win1_enabled() || dispcnt.winobj_enabled();

        for priority in (0..4u8).rev() {
            for bg in 0..4 {
                let Some(line_pixels) = &bg_lines[bg] else { continue };
                if io.bgcnt(bg).priority() != priority {
                    continue;
                }
                for x in 0..SCREEN_WIDTH {
                    let px = line_pixels[x];
                    if !px.visible {
                        continue;
                    }
                    if windows_active && !self.window_enables(io, x, line, &sprites)[bg] {
                        continue;
                    }
                    merge_layer(&mut result[x], px, bg, bldcnt.mode(), bldcnt.top_enabled(bg), bldcnt.bot_enabled(bg), eva, evb, evy);
                }
            }
            for spr in sprites.iter().filter(|s| s.priority == priority && s.mode != 2) {
                self.blit_sprite(io, bus, spr, line, &mut result, bldcnt, eva, evb, evy);
            }
        }

        for x in 0..SCREEN_WIDTH {
            self.output[row_base + x] = expand_color(result[x].color, io.dispcnt().forced_blank());
        }
    }

    fn window_enables(&self, io: &IoRegs, x: usize, y: usize, sprites: &[Sprite]) -> [bool; 4] {
        let dispcnt = io.dispcnt();
        let mut enable_bg = [true; 4];
        if !(dispcnt.win0_enabled() || dispcnt.win1_enabled() || dispcnt.winobj_enabled()) {
            return enable_bg;
        }

        let in_win = |win: usize| -> bool {
            let (x1, x2) = io.winh(win);
            let (y1, y2) = io.winv(win);
            let in_x = if x1 <= x2 { (x1 as usize..x2 as usize).contains(&x) } else { x >= x1 as usize || x < x2 as usize };
            let in_y = if y1 <= y2 { (y1 as usize..y2 as usize).contains(&y) } else { y >= y1 as usize || y < y2 as usize };
            in_x && in_y
        };

        let obj_window_hit = dispcnt.winobj_enabled() && sprites.iter().any(|s| s.mode == 2 && sprite_hit(s, x, y));

        let winin = io.winin();
        let winout = io.winout();
        let mask = if dispcnt.win0_enabled() && in_win(0) {
            winin & 0xFF
        } else if dispcnt.win1_enabled() && in_win(1) {
            (winin >> 8) & 0xFF
        } else if obj_window_hit {
            (winout >> 8) & 0xFF
        } else {
            winout & 0xFF
        };

        for b in 0..4 {
            enable_bg[b] = (mask >> b) & 1 != 0;
        }
        enable_bg
    }

    fn render_text_bg(&self, io: &IoRegs, bus: &Bus, bg: usize, line: usize) -> Vec<Pixel> {
        let cnt = io.bgcnt(bg);
        let hofs = io.bg_hofs(bg) as usize;
        let vofs = io.bg_vofs(bg) as usize;
        let (map_w, map_h) = text_map_size(cnt.screen_size());
        let y = (line + vofs) % map_h;
        let tile_row = y / 8;
        let pixel_row = y % 8;

        let mut out = vec![Pixel::default(); SCREEN_WIDTH];
        for sx in 0..SCREEN_WIDTH {
            let x = (sx + hofs) % map_w;
            let tile_col = x / 8;
            let pixel_col = x % 8;

            let map_block = screen_block_index(tile_col, tile_row, map_w / 8);
            let screen_base = cnt.screen_base_block() as usize * 0x800 + map_block * 2;
            let entry = read_vram16(bus, screen_base);
            let tile_num = entry & 0x3FF;
            let h_flip = (entry >> 10) & 1 != 0;
            let v_flip = (entry >> 11) & 1 != 0;
            let palette_bank = ((entry >> 12) & 0xF) as u8;

            let row = if v_flip { 7 - pixel_row } else { pixel_row };
            let col = if h_flip { 7 - pixel_col } else { pixel_col };

            let char_base = cnt.char_base_block() as usize * 0x4000;
            let (idx, transparent) = if cnt.palette_256() {
                let tile_addr = char_base + tile_num as usize * 64 + row * 8 + col;
                let b = read_vram8(bus, tile_addr);
                (b as u16, b == 0)
            } else {
                let tile_addr = char_base + tile_num as usize * 32 + row * 4 + col / 2;
                let b = read_vram8(bus, tile_addr);
                let nibble = if col & 1 == 0 { b & 0xF } else { b >> 4 };
                (nibble as u16, nibble == 0)
            };

            out[sx] = if transparent {
                Pixel { color: 0, visible: false, force_blend: false }
            } else {
                let pal_idx = if cnt.palette_256() { idx } else { (palette_bank as u16) * 16 + idx };
                Pixel { color: read_palette(bus, 0, pal_idx), visible: true, force_blend: false }
            };
        }
        out
    }

    fn render_affine_bg(&self, io: &IoRegs, bus: &Bus, bg: usize, line: usize) -> Vec<Pixel> {
        let bg2 = bg == 2;
        let cnt = io.bgcnt(bg);
        let (pa, _, pc, _) = io.bg_affine_params(bg2);
        let latch = self.affine[if bg2 { 0 } else { 1 }];
        let size_px = 128usize << cnt.screen_size().min(3);
        let wrap = cnt.wraparound();

        let mut out = vec![Pixel::default(); SCREEN_WIDTH];
        let mut tx = latch.x;
        let mut ty = latch.y;
        let _ = line;
        for sx in 0..SCREEN_WIDTH {
            let (px, py) = (tx >> 8, ty >> 8);
            let (mut mx, mut my) = (px, py);
            let in_bounds = (0..size_px as i32).contains(&mx) && (0..size_px as i32).contains(&my);
            if wrap {
                mx = mx.rem_euclid(size_px as i32);
                my = my.rem_euclid(size_px as i32);
            }
            if in_bounds || wrap {
                let tile_col = (mx as usize) / 8;
                let tile_row = (my as usize) / 8;
                let map_w_tiles = size_px / 8;
                let screen_base = cnt.screen_base_block() as usize * 0x800 + tile_row * map_w_tiles + tile_col;
                let tile_num = read_vram8(bus, screen_base) as usize;
                let char_base = cnt.char_base_block() as usize * 0x4000;
                let (row, col) = ((my as usize) % 8, (mx as usize) % 8);
                let tile_addr = char_base + tile_num * 64 + row * 8 + col;
                let idx = read_vram8(bus, tile_addr);
                out[sx] = if idx == 0 {
                    Pixel { color: 0, visible: false, force_blend: false }
                } else {
                    Pixel { color: read_palette(bus, 0, idx as u16), visible: true, force_blend: false }
                };
            } else {
                out[sx] = Pixel { color: 0, visible: false, force_blend: false };
            }
            tx = tx.wrapping_add(pa as i32);
            ty = ty.wrapping_add(pc as i32);
        }
        out
    }

    fn render_bitmap_mode3(&self, bus: &Bus, line: usize) -> Vec<Pixel> {
        let mut out = vec![Pixel::default(); SCREEN_WIDTH];
        for x in 0..SCREEN_WIDTH {
            let off = (line * SCREEN_WIDTH + x) * 2;
            let color = read_vram16(bus, off) & 0x7FFF;
            out[x] = Pixel { color, visible: true, force_blend: false };
        }
        out
    }

    fn render_bitmap_mode4(&self, io: &IoRegs, bus: &Bus, line: usize) -> Vec<Pixel> {
        let frame = if io.dispcnt().frame_select() { 0xA000 } else { 0 };
        let mut out = vec![Pixel::default(); SCREEN_WIDTH];
        for x in 0..SCREEN_WIDTH {
            let idx = read_vram8(bus, frame + line * SCREEN_WIDTH + x);
            out[x] =
                if idx == 0 { Pixel { color: 0, visible: false, force_blend: false } } else { Pixel { color: read_palette(bus, 0, idx as u16), visible: true, force_blend: false } };
        }
        out
    }

    fn render_bitmap_mode5(&self, io: &IoRegs, bus: &Bus, line: usize) -> Vec<Pixel> {
        const W5: usize = 160;
        const H5: usize = 128;
        let frame = if io.dispcnt().frame_select() { 0xA000 } else { 0 };
        let mut out = vec![Pixel::default(); SCREEN_WIDTH];
        if line >= H5 {
            return out;
        }
        for x in 0..SCREEN_WIDTH {
            if x >= W5 {
                continue;
            }
            let off = frame + (line * W5 + x) * 2;
            let color = read_vram16(bus, off) & 0x7FFF;
            out[x] = Pixel { color, visible: true, force_blend: false };
        }
        out
    }

    fn gather_sprites(&self, bus: &Bus, line: usize) -> Vec<Sprite> {
        let mut sprites = Vec::new();
        for i in 0..128usize {
            let base = i * 8;
            let attr0 = read_oam16(bus, base);
            let attr1 = read_oam16(bus, base + 2);
            let attr2 = read_oam16(bus, base + 4);

            let rotscale = (attr0 >> 8) & 1 != 0;
            let disabled = !rotscale && (attr0 >> 9) & 1 != 0;
            if disabled {
                continue;
            }
            let shape = (attr0 >> 14) & 0x3;
            let size = (attr1 >> 14) & 0x3;
            let (w, h) = sprite_dimensions(shape as u8, size as u8);

            let mut y = (attr0 & 0xFF) as i32;
            if y + h > 256 {
                y -= 256;
            }
            if (line as i32) < y || (line as i32) >= y + h {
                continue;
            }

            let mut x = (attr1 & 0x1FF) as i32;
            if x >= 240 {
                x -= 512;
            }

            sprites.push(Sprite {
                y,
                x,
                width: w,
                height: h,
                tile: (attr2 & 0x3FF) as u32,
                palette: ((attr2 >> 12) & 0xF) as u8,
                depth8: (attr0 >> 13) & 1 != 0,
                h_flip: !rotscale && (attr1 >> 12) & 1 != 0,
                v_flip: !rotscale && (attr1 >> 13) & 1 != 0,
                priority: ((attr2 >> 10) & 0x3) as u8,
                mode: ((attr0 >> 10) & 0x3) as u8,
                mosaic: (attr0 >> 12) & 1 != 0,
            });
        }
        sprites
    }

    fn blit_sprite(
        &self,
        io: &IoRegs,
        bus: &Bus,
        spr: &Sprite,
        line: usize,
        result: &mut [Pixel],
        bldcnt: crate::io_regs::BldCnt,
        eva: u16,
        evb: u16,
        evy: u16,
    ) {
        let one_d = io.dispcnt().obj_1d_mapping();
        let row_in_sprite = line as i32 - spr.y;
        let row = if spr.v_flip { spr.height - 1 - row_in_sprite } else { row_in_sprite };
        let tile_row = row / 8;
        let in_tile_row = (row % 8) as usize;
        let tiles_wide = spr.width / 8;

        for col in 0..spr.width {
            let sx = spr.x + col;
            if !(0..SCREEN_WIDTH as i32).contains(&sx) {
                continue;
            }
            let draw_col = if spr.h_flip { spr.width - 1 - col } else { col };
            let tile_col = draw_col / 8;
            let in_tile_col = (draw_col % 8) as usize;

            let tile_num = if spr.depth8 {
                let stride = if one_d { tiles_wide } else { 32 / 2 };
                spr.tile + (tile_row * stride + tile_col) as u32 * 2
            } else {
                let stride = if one_d { tiles_wide } else { 32 };
                spr.tile + (tile_row * stride + tile_col) as u32
            };

            let color = if spr.depth8 {
                let tile_addr = OBJ_TILE_BASE + tile_num as usize * 32 + in_tile_row * 8 + in_tile_col;
                let idx = read_vram8(bus, tile_addr);
                if idx == 0 {
                    None
                } else {
                    Some(read_palette(bus, 1, idx as u16))
                }
            } else {
                let tile_addr = OBJ_TILE_BASE + tile_num as usize * 32 + in_tile_row * 4 + in_tile_col / 2;
                let b = read_vram8(bus, tile_addr);
                let nibble = if in_tile_col & 1 == 0 { b & 0xF } else { b >> 4 };
                if nibble == 0 {
                    None
                } else {
                    Some(read_palette(bus, 1, spr.palette as u16 * 16 + nibble as u16))
                }
            };

            if let Some(color) = color {
                let px = Pixel { color, visible: true, force_blend: spr.mode == 1 };
                merge_layer(&mut result[sx as usize], px, 4, bldcnt.mode(), px.force_blend || bldcnt.top_enabled(4), bldcnt.bot_enabled(4), eva, evb, evy);
            }
        }
    }
}

fn sprite_hit(spr: &Sprite, x: usize, y: usize) -> bool {
    (spr.x..spr.x + spr.width).contains(&(x as i32)) && (spr.y..spr.y + spr.height).contains(&(y as i32))
}

fn sprite_dimensions(shape: u8, size: u8) -> (i32, i32) {
    match (shape, size) {
        (0, 0) => (8, 8),
        (0, 1) => (16, 16),
        (0, 2) => (32, 32),
        (0, 3) => (64, 64),
        (1, 0) => (16, 8),
        (1, 1) => (32, 8),
        (1, 2) => (32, 16),
        (1, 3) => (64, 32),
        (2, 0) => (8, 16),
        (2, 1) => (8, 32),
        (2, 2) => (16, 32),
        (2, 3) => (32, 64),
        _ => (8, 8),
    }
}

fn text_map_size(screen_size: u8) -> (usize, usize) {
    match screen_size & 0x3 {
        0 => (256, 256),
        1 => (512, 256),
        2 => (256, 512),
        _ => (512, 512),
    }
}

/// Text-mode screen blocks are laid out left-to-right, top-to-bottom within
/// each 32x32-tile block, and blocks wider than 32 tiles or taller than 32
/// tiles are separate 2KiB blocks appended after the first.
fn screen_block_index(tile_col: usize, tile_row: usize, map_w_tiles: usize) -> usize {
    let block_col = tile_col / 32;
    let block_row = tile_row / 32;
    let blocks_per_row = map_w_tiles / 32;
    let block = block_row * blocks_per_row + block_col;
    let local = (tile_row % 32) * 32 + (tile_col % 32);
    block * 1024 + local
}

fn read_vram8(bus: &Bus, addr: usize) -> u8 {
    bus.vram().get(addr % bus.vram().len()).copied().unwrap_or(0)
}

fn read_vram16(bus: &Bus, addr: usize) -> u16 {
    let v = bus.vram();
    let a = addr % v.len();
    u16::from_le_bytes([v[a], v[(a + 1) % v.len()]])
}

fn read_oam16(bus: &Bus, addr: usize) -> u16 {
    let o = bus.oam();
    let a = addr % o.len();
    u16::from_le_bytes([o[a], o[(a + 1) % o.len()]])
}

/// `bank` selects BG (0) vs OBJ (1) palette half (each 256 entries of 2 bytes).
fn read_palette(bus: &Bus, bank: usize, idx: u16) -> u16 {
    let pal = bus.palette();
    let off = bank * 0x200 + (idx as usize % 256) * 2;
    let a = off % pal.len();
    u16::from_le_bytes([pal[a], pal[(a + 1) % pal.len()]])
}

fn expand_color(c: u16, forced_blank: bool) -> u32 {
    if forced_blank {
        return 0xFFFF_FFFF;
    }
    let r = (c & 0x1F) as u32;
    let g = ((c >> 5) & 0x1F) as u32;
    let b = ((c >> 10) & 0x1F) as u32;
    let expand = |v: u32| (v << 3) | (v >> 2);
    0xFF00_0000 | (expand(r) << 16) | (expand(g) << 8) | expand(b)
}

/// Applies window opacity (already filtered by the caller) then BLDCNT's
/// blend operation, writing the merged result into `dst.bot`'s slot.
#[allow(clippy::too_many_arguments)]
fn merge_layer(dst: &mut Pixel, top: Pixel, _layer: usize, mode: BlendMode, top_enabled: bool, bot_enabled: bool, eva: u16, evb: u16, evy: u16) {
    if !top.visible {
        return;
    }
    match mode {
        BlendMode::Alpha if top_enabled && bot_enabled => {
            let blend = |t: u32, b: u32| ((t * eva as u32 + b * evb as u32) >> 4).min(31);
            *dst = Pixel {
                color: pack_rgb(blend(r5(top.color), r5(dst.color)), blend(g5(top.color), g5(dst.color)), blend(b5(top.color), b5(dst.color))),
                visible: true,
                force_blend: false,
            };
        }
        BlendMode::Light if top_enabled => {
            let light = |c: u32| c + (((31 - c) * evy as u32) >> 4).min(31 - c);
            *dst = Pixel { color: pack_rgb(light(r5(top.color)), light(g5(top.color)), light(b5(top.color))), visible: true, force_blend: false };
        }
        BlendMode::Dark if top_enabled => {
            let dark = |c: u32| c - ((c * evy as u32) >> 4).min(c);
            *dst = Pixel { color: pack_rgb(dark(r5(top.color)), dark(g5(top.color)), dark(b5(top.color))), visible: true, force_blend: false };
        }
        _ => {
            *dst = top;
        }
    }
}

fn r5(c: u16) -> u32 {
    (c & 0x1F) as u32
}
fn g5(c: u16) -> u32 {
    ((c >> 5) & 0x1F) as u32
}
fn b5(c: u16) -> u32 {
    ((c >> 10) & 0x1F) as u32
}
fn pack_rgb(r: u32, g: u32, b: u32) -> u16 {
    (r as u16) | ((g as u16) << 5) | ((b as u16) << 10)
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::backup::BackupKind;
    use crate::channel::Framebuffer;
    use crate::dma::DmaController;
    use crate::io_regs::IoRegs;
    use crate::scheduler::Scheduler;

    #[test]
    fn hdraw_wraps_vcount_modulo_228_and_bumps_frame_count() {
        let mut ppu = Ppu::new();
        let mut io = IoRegs::new();
        let mut dma = DmaController::new();
        let mut sched = Scheduler::new();
        let fb = Framebuffer::new(SCREEN_WIDTH, SCREEN_HEIGHT);

        for _ in 0..TOTAL_LINES {
            ppu.on_hdraw(&mut io, &mut dma, &mut sched, &fb);
        }
        assert_eq!(ppu.vcount, 0);
        assert_eq!(ppu.frame_count, 1);
    }

    #[test]
    fn entering_vblank_sets_dispstat_flag_and_copies_framebuffer() {
        let mut ppu = Ppu::new();
        let mut io = IoRegs::new();
        let mut dma = DmaController::new();
        let mut sched = Scheduler::new();
        let fb = Framebuffer::new(SCREEN_WIDTH, SCREEN_HEIGHT);

        for _ in 0..SCREEN_HEIGHT {
            ppu.on_hdraw(&mut io, &mut dma, &mut sched, &fb);
        }
        assert!(io.dispstat().vblank());
    }

    #[test]
    fn forced_blank_scanline_is_all_white() {
        let mut ppu = Ppu::new();
        let mut io = IoRegs::new();
        io.set_dispcnt(crate::io_regs::DispCnt(1 << 7));
        let bus = Bus::new(BackupKind::None, false);
        ppu.render_scanline(&io, &bus, 0);
        assert_eq!(ppu.output[0], 0xFFFF_FFFF);
    }

    #[test]
    fn expand_color_matches_5_to_8_bit_formula() {
        assert_eq!(expand_color(0, false) & 0xFF, (0u32 << 3) | (0 >> 2));
        assert_eq!(expand_color(0x1F, false) & 0xFF, 0xFF);
    }

    #[test]
    fn sprite_dimension_table_matches_shape_size_pairs() {
        assert_eq!(sprite_dimensions(0, 0), (8, 8));
        assert_eq!(sprite_dimensions(1, 3), (64, 32));
        assert_eq!(sprite_dimensions(2, 2), (16, 32));
    }
}
