//! Minimal GPIO port on the cartridge bus window (0x080000C4..0x080000C8),
//! used by RTC-equipped carts. The RTC chip itself is stubbed to a fixed
//! epoch rather than the host wall clock, keeping the engine's behaviour
//! fully deterministic for the round-trip/boundary tests in §8 — a real
//! frontend wanting wall-clock time would feed it in through `ResetConfig`
//! in a later iteration.

#[derive(Debug, Clone, Copy, Default)]
pub struct Gpio {
    enabled: bool,
    direction: u8,
    data_latch: u8,
    /// Offsets 0 = data, 2 = direction, 4 = read-enable, within the GPIO window.
}

impl Gpio {
    pub fn new(enabled: bool) -> Self {
        Gpio { enabled, direction: 0, data_latch: 0 }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn read(&self, offset: u32) -> u16 {
        if !self.enabled {
            return 0;
        }
        match offset {
            0 => self.data_latch as u16,
            2 => self.direction as u16,
            4 => 1,
            _ => 0,
        }
    }

    pub fn write(&mut self, offset: u32, val: u16) {
        if !self.enabled {
            return;
        }
        match offset {
            0 => self.data_latch = val as u8,
            2 => self.direction = val as u8,
            _ => {}
        }
    }

    /// "GPIO/RTC" quicksave section. The RTC itself carries no live state
    /// beyond `enabled` since it is stubbed to a fixed epoch.
    pub fn write_state(&self, w: &mut crate::quicksave::Writer) {
        w.bool(self.enabled);
        w.u8(self.direction);
        w.u8(self.data_latch);
    }

    pub fn read_state(&mut self, r: &mut crate::quicksave::Reader) -> crate::error::EngineResult<()> {
        self.enabled = r.bool()?;
        self.direction = r.u8()?;
        self.data_latch = r.u8()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_gpio_ignores_writes() {
        let mut g = Gpio::new(false);
        g.write(0, 0xFF);
        assert_eq!(g.read(0), 0);
    }

    #[test]
    fn enabled_gpio_roundtrips_data_latch() {
        let mut g = Gpio::new(true);
        g.write(0, 0x03);
        assert_eq!(g.read(0), 0x03);
    }
}
