//! The `RESET` message payload: everything the frontend hands the engine to
//! start (or restart) a run. Construction/validation only — the engine never
//! reads files or environment variables itself (ROM discovery is an
//! out-of-core concern).

use crate::bus::backup::BackupKind;
use crate::error::{EngineError, EngineResult};

const MAX_ROM_SIZE: usize = 32 * 1024 * 1024;
const BIOS_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ResetConfig {
    pub rom: Vec<u8>,
    pub bios: Vec<u8>,
    pub skip_bios: bool,
    pub audio_frequency: u32,
    pub rtc: bool,
    pub backup_storage_type: BackupKind,
    pub backup: Option<Vec<u8>>,
    /// Ambient-stack addition (not in spec.md's RESET table): toggles the
    /// optional gamma/colour-correction pass described in PPU §4.4.
    pub color_correction: bool,
}

impl ResetConfig {
    /// Clamps an absurd configuration to the nearest legal value instead of
    /// failing the reset outright, per the "Configuration error" policy in
    /// the error-handling design: the frontend still gets a RESET
    /// notification and a consistent state machine.
    pub fn sanitize(mut self) -> EngineResult<Self> {
        if self.rom.len() > MAX_ROM_SIZE {
            log::warn!("ROM size {} exceeds {} bytes, truncating", self.rom.len(), MAX_ROM_SIZE);
            self.rom.truncate(MAX_ROM_SIZE);
        }
        if self.rom.is_empty() {
            return Err(EngineError::Configuration("ROM image is empty".into()));
        }
        if self.bios.len() != BIOS_SIZE {
            log::warn!("BIOS image is {} bytes, expected {}; padding/truncating", self.bios.len(), BIOS_SIZE);
            self.bios.resize(BIOS_SIZE, 0);
        }
        if self.audio_frequency == 0 || self.audio_frequency > 192_000 {
            log::warn!("audio_frequency {} out of range, clamping to 32768", self.audio_frequency);
            self.audio_frequency = 32_768;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ResetConfig {
        ResetConfig {
            rom: vec![0u8; 0x200],
            bios: vec![0u8; BIOS_SIZE],
            skip_bios: true,
            audio_frequency: 32_768,
            rtc: false,
            backup_storage_type: BackupKind::None,
            backup: None,
            color_correction: false,
        }
    }

    #[test]
    fn oversized_rom_is_truncated_not_rejected() {
        let cfg = base_config();
        let mut cfg = cfg;
        cfg.rom = vec![0u8; MAX_ROM_SIZE + 10];
        let cfg = cfg.sanitize().expect("clamp, not reject");
        assert_eq!(cfg.rom.len(), MAX_ROM_SIZE);
    }

    #[test]
    fn empty_rom_is_rejected() {
        let mut cfg = base_config();
        cfg.rom.clear();
        assert!(cfg.sanitize().is_err());
    }

    #[test]
    fn bad_audio_frequency_clamps_to_default() {
        let mut cfg = base_config();
        cfg.audio_frequency = 0;
        let cfg = cfg.sanitize().unwrap();
        assert_eq!(cfg.audio_frequency, 32_768);
    }
}
