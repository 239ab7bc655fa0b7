//! Cartridge backup storage: SRAM, Flash (64K/128K), or EEPROM (4K/64K), each
//! carrying its own command/state machine. Mirrors the tagged-variant design
//! from §3 ("Backup storage") and the teacher's habit of giving each
//! peripheral its own small `Fooo::new()`/`run()`/register-handler surface
//! (here: `read`/`write`).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupKind {
    #[default]
    None,
    Sram32K,
    Flash64K,
    Flash128K,
    Eeprom4K,
    Eeprom64K,
}

impl BackupKind {
    pub fn size(self) -> usize {
        match self {
            BackupKind::None => 0,
            BackupKind::Sram32K => 32 * 1024,
            BackupKind::Flash64K => 64 * 1024,
            BackupKind::Flash128K => 128 * 1024,
            BackupKind::Eeprom4K => 512,
            BackupKind::Eeprom64K => 8 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlashCommandState {
    Idle,
    Cmd1,
    Cmd2,
    EraseCmd1,
    EraseCmd2,
}

struct FlashState {
    chip_id_mode: bool,
    erase_pending: bool,
    bank: usize,
    cmd_state: FlashCommandState,
}

impl FlashState {
    fn new() -> Self {
        FlashState { chip_id_mode: false, erase_pending: false, bank: 0, cmd_state: FlashCommandState::Idle }
    }
}

struct EepromState {
    address_bits: u32,
    bit_stream: Vec<u8>,
    reading: bool,
    read_buffer: u64,
    read_bits_remaining: u32,
}

impl EepromState {
    fn new(address_bits: u32) -> Self {
        EepromState { address_bits, bit_stream: Vec::new(), reading: false, read_buffer: 0, read_bits_remaining: 0 }
    }
}

pub struct BackupStorage {
    kind: BackupKind,
    data: Vec<u8>,
    flash: FlashState,
    eeprom: EepromState,
}

const FLASH_DEVICE_ID_SST: u8 = 0xD4;
const FLASH_MANUFACTURER_SST: u8 = 0xBF;

impl BackupStorage {
    pub fn new(kind: BackupKind) -> Self {
        BackupStorage {
            kind,
            data: vec![0xFF; kind.size().max(1)],
            flash: FlashState::new(),
            eeprom: EepromState::new(if kind == BackupKind::Eeprom64K { 14 } else { 6 }),
        }
    }

    pub fn kind(&self) -> BackupKind {
        self.kind
    }

    pub fn load(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn snapshot(&self) -> &[u8] {
        &self.data
    }

    pub fn read_sram(&self, addr: u32) -> u8 {
        match self.kind {
            BackupKind::Sram32K => {
                let off = (addr as usize) % self.data.len();
                self.data[off]
            }
            BackupKind::Flash64K | BackupKind::Flash128K => self.flash_read(addr),
            _ => 0xFF,
        }
    }

    pub fn write_sram(&mut self, addr: u32, val: u8) {
        match self.kind {
            BackupKind::Sram32K => {
                let off = (addr as usize) % self.data.len();
                self.data[off] = val;
            }
            BackupKind::Flash64K | BackupKind::Flash128K => self.flash_write(addr, val),
            _ => {}
        }
    }

    fn flash_read(&self, addr: u32) -> u8 {
        let off = addr as usize & 0xFFFF;
        if self.flash.chip_id_mode && off < 2 {
            return if off == 0 { FLASH_MANUFACTURER_SST } else { FLASH_DEVICE_ID_SST };
        }
        let bank_off = self.flash.bank * 0x10000 + off;
        self.data.get(bank_off).copied().unwrap_or(0xFF)
    }

    fn flash_write(&mut self, addr: u32, val: u8) {
        let off = addr as usize & 0xFFFF;
        match (self.flash.cmd_state, off, val) {
            (FlashCommandState::Idle, 0x5555, 0xAA) => self.flash.cmd_state = FlashCommandState::Cmd1,
            (FlashCommandState::Cmd1, 0x2AAA, 0x55) => self.flash.cmd_state = FlashCommandState::Cmd2,
            (FlashCommandState::Cmd2, 0x5555, 0x90) => {
                self.flash.chip_id_mode = true;
                self.flash.cmd_state = FlashCommandState::Idle;
            }
            (FlashCommandState::Cmd2, 0x5555, 0xF0) => {
                self.flash.chip_id_mode = false;
                self.flash.cmd_state = FlashCommandState::Idle;
            }
            (FlashCommandState::Cmd2, 0x5555, 0x80) => self.flash.cmd_state = FlashCommandState::EraseCmd1,
            (FlashCommandState::EraseCmd1, 0x5555, 0xAA) => self.flash.cmd_state = FlashCommandState::EraseCmd2,
            (FlashCommandState::EraseCmd2, 0x5555, 0x10) => {
                // Erase entire chip to 0xFF.
                for b in self.data.iter_mut() {
                    *b = 0xFF;
                }
                self.flash.cmd_state = FlashCommandState::Idle;
            }
            (FlashCommandState::EraseCmd2, _, 0x30) => {
                // Erase the 4KiB sector containing `off`.
                let sector = off & !0xFFF;
                let bank_base = self.flash.bank * 0x10000;
                for b in self.data[bank_base + sector..bank_base + sector + 0x1000].iter_mut() {
                    *b = 0xFF;
                }
                self.flash.cmd_state = FlashCommandState::Idle;
            }
            (FlashCommandState::Cmd2, 0x5555, 0xA0) => {
                // Byte-program: the next write to any address programs that byte.
                self.flash.cmd_state = FlashCommandState::Idle;
                self.flash.erase_pending = true;
            }
            (FlashCommandState::Cmd2, 0x5555, 0xB0) if self.kind == BackupKind::Flash128K => {
                self.flash.bank = 0; // bank switch set by the following write
                self.flash.cmd_state = FlashCommandState::Idle;
            }
            _ if self.flash.erase_pending => {
                let bank_off = self.flash.bank * 0x10000 + off;
                if let Some(b) = self.data.get_mut(bank_off) {
                    *b &= val;
                }
                self.flash.erase_pending = false;
            }
            _ => self.flash.cmd_state = FlashCommandState::Idle,
        }
    }

    // ---- EEPROM, driven by DMA unit-count clocking of a serial bit stream ----

    pub fn eeprom_clock_bit(&mut self, bit: u8) -> u8 {
        if self.eeprom.reading {
            if self.eeprom.read_bits_remaining == 0 {
                self.eeprom.reading = false;
                return 0;
            }
            self.eeprom.read_bits_remaining -= 1;
            ((self.eeprom.read_buffer >> self.eeprom.read_bits_remaining) & 1) as u8
        } else {
            self.eeprom.bit_stream.push(bit & 1);
            self.try_execute_command();
            1
        }
    }

    fn try_execute_command(&mut self) {
        let stream = &self.eeprom.bit_stream;
        if stream.len() < 2 {
            return;
        }
        let opcode = (stream[0] << 1) | stream[1];
        let addr_bits = self.eeprom.address_bits as usize;
        match opcode {
            0b11 => {
                // Read request: 2-bit opcode + address bits + 1 stop bit.
                if stream.len() == 2 + addr_bits + 1 {
                    let addr = bits_to_value(&stream[2..2 + addr_bits]) as usize * 8;
                    let mut word: u64 = 0;
                    for i in 0..8 {
                        word = (word << 8) | *self.data.get(addr + i).unwrap_or(&0) as u64;
                    }
                    self.eeprom.read_buffer = word;
                    self.eeprom.read_bits_remaining = 64;
                    self.eeprom.reading = true;
                    self.eeprom.bit_stream.clear();
                }
            }
            0b10 => {
                // Write request: 2-bit opcode + address bits + 64 data bits + stop bit.
                if stream.len() == 2 + addr_bits + 64 + 1 {
                    let addr = bits_to_value(&stream[2..2 + addr_bits]) as usize * 8;
                    let data_bits = &stream[2 + addr_bits..2 + addr_bits + 64];
                    for (i, chunk) in data_bits.chunks(8).enumerate() {
                        if let Some(b) = self.data.get_mut(addr + i) {
                            *b = bits_to_value(chunk) as u8;
                        }
                    }
                    self.eeprom.bit_stream.clear();
                }
            }
            _ => {
                if stream.len() > 2 + addr_bits + 64 + 2 {
                    self.eeprom.bit_stream.clear();
                }
            }
        }
    }
}

fn bits_to_value(bits: &[u8]) -> u64 {
    bits.iter().fold(0u64, |acc, &b| (acc << 1) | (b as u64 & 1))
}

fn flash_cmd_state_tag(s: FlashCommandState) -> u8 {
    match s {
        FlashCommandState::Idle => 0,
        FlashCommandState::Cmd1 => 1,
        FlashCommandState::Cmd2 => 2,
        FlashCommandState::EraseCmd1 => 3,
        FlashCommandState::EraseCmd2 => 4,
    }
}

fn flash_cmd_state_from_tag(tag: u8) -> FlashCommandState {
    match tag {
        1 => FlashCommandState::Cmd1,
        2 => FlashCommandState::Cmd2,
        3 => FlashCommandState::EraseCmd1,
        4 => FlashCommandState::EraseCmd2,
        _ => FlashCommandState::Idle,
    }
}

impl BackupStorage {
    /// Appends the "flash/EEPROM state" quicksave section: the raw backup
    /// image plus whichever command state machine is live for this `kind`.
    pub fn write_state(&self, w: &mut crate::quicksave::Writer) {
        w.sized_bytes(&self.data);
        w.bool(self.flash.chip_id_mode);
        w.bool(self.flash.erase_pending);
        w.u32(self.flash.bank as u32);
        w.u8(flash_cmd_state_tag(self.flash.cmd_state));
        w.u32(self.eeprom.address_bits);
        w.sized_bytes(&self.eeprom.bit_stream);
        w.bool(self.eeprom.reading);
        w.u64(self.eeprom.read_buffer);
        w.u32(self.eeprom.read_bits_remaining);
    }

    pub fn read_state(&mut self, r: &mut crate::quicksave::Reader) -> crate::error::EngineResult<()> {
        let data = r.sized_bytes()?;
        if data.len() != self.data.len() {
            return Err(crate::error::EngineError::SnapshotMismatch(format!(
                "backup data size mismatch: expected {}, found {}",
                self.data.len(),
                data.len()
            )));
        }
        self.data = data;
        self.flash.chip_id_mode = r.bool()?;
        self.flash.erase_pending = r.bool()?;
        self.flash.bank = r.u32()? as usize;
        self.flash.cmd_state = flash_cmd_state_from_tag(r.u8()?);
        self.eeprom.address_bits = r.u32()?;
        self.eeprom.bit_stream = r.sized_bytes()?;
        self.eeprom.reading = r.bool()?;
        self.eeprom.read_buffer = r.u64()?;
        self.eeprom.read_bits_remaining = r.u32()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sram_read_write_roundtrip() {
        let mut b = BackupStorage::new(BackupKind::Sram32K);
        b.write_sram(0x1234, 0x42);
        assert_eq!(b.read_sram(0x1234), 0x42);
    }

    #[test]
    fn flash_chip_id_sequence() {
        let mut b = BackupStorage::new(BackupKind::Flash64K);
        b.flash_write(0x5555, 0xAA);
        b.flash_write(0x2AAA, 0x55);
        b.flash_write(0x5555, 0x90);
        assert_eq!(b.flash_read(0x0000), FLASH_MANUFACTURER_SST);
        assert_eq!(b.flash_read(0x0001), FLASH_DEVICE_ID_SST);
        b.flash_write(0x5555, 0xAA);
        b.flash_write(0x2AAA, 0x55);
        b.flash_write(0x5555, 0xF0);
        assert!(!b.flash.chip_id_mode);
    }

    #[test]
    fn flash_chip_erase_resets_to_0xff() {
        let mut b = BackupStorage::new(BackupKind::Flash64K);
        b.data[10] = 0x00;
        b.flash_write(0x5555, 0xAA);
        b.flash_write(0x2AAA, 0x55);
        b.flash_write(0x5555, 0x80);
        b.flash_write(0x5555, 0xAA);
        b.flash_write(0x2AAA, 0x55);
        b.flash_write(0x5555, 0x10);
        assert_eq!(b.data[10], 0xFF);
    }

    #[test]
    fn eeprom_write_then_read_roundtrip_4k() {
        let mut b = BackupStorage::new(BackupKind::Eeprom4K);
        let mut bits = vec![1, 0]; // write opcode
        bits.extend(std::iter::repeat(0).take(5));
        bits.push(1); // address = 0b000001 -> word 1
        for byte in [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x00] {
            for i in (0..8).rev() {
                bits.push((byte >> i) & 1);
            }
        }
        bits.push(0); // stop bit
        for bit in &bits {
            b.eeprom_clock_bit(*bit);
        }
        assert_eq!(&b.data[8..16], &[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x00]);
    }
}
