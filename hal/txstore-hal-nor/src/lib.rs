//! NOR flash bank backend
//!
//! Adapts an erase-aligned window of any [`NorFlash`] device to the
//! [`FlashBank`] trait, so the storage engine runs against every chip HAL
//! that implements the `embedded-storage` traits (memory-mapped internal
//! flash, external SPI NOR, ...).
//!
//! The record framing programs individual header bytes, so the device
//! must be byte-programmable (`WRITE_SIZE == 1`). Devices with wider
//! program units cannot back a bank and are rejected at construction.

#![no_std]
#![deny(unsafe_code)]

use embedded_storage::nor_flash::NorFlash;
use txstore_hal::{BankError, FlashBank};

/// One erase-aligned window of a NOR flash device, usable as a bank
///
/// Two of these, over disjoint windows, back a store:
///
/// ```ignore
/// let bank0 = NorBank::new(flash0, 0x0000, SECTOR_SIZE)?;
/// let bank1 = NorBank::new(flash1, 0x0000, SECTOR_SIZE)?;
/// let store = TxStore::<_, _, u32>::new(bank0, bank1, defaults)?;
/// ```
pub struct NorBank<F> {
    flash: F,
    base: u32,
    size: u32,
}

impl<F: NorFlash> NorBank<F> {
    /// Wrap the window `[base, base + size)` of `flash`
    ///
    /// The window must be non-empty, aligned to whole erase units, inside
    /// the device, and the device must be byte-programmable; otherwise
    /// [`BankError::Geometry`] is returned.
    pub fn new(flash: F, base: u32, size: u32) -> Result<Self, BankError> {
        let erase_size = F::ERASE_SIZE as u32;
        if size == 0
            || F::WRITE_SIZE != 1
            || base % erase_size != 0
            || size % erase_size != 0
        {
            return Err(BankError::Geometry);
        }
        let end = base.checked_add(size).ok_or(BankError::Geometry)?;
        if end as usize > flash.capacity() {
            return Err(BankError::Geometry);
        }
        Ok(Self { flash, base, size })
    }

    /// Hand the device back, e.g. to repurpose it after tearing the
    /// store down
    pub fn release(self) -> F {
        self.flash
    }

    fn device_offset(&self, offset: usize, len: usize) -> Result<u32, BankError> {
        let end = offset.checked_add(len).ok_or(BankError::OutOfBounds)?;
        if end > self.size as usize {
            return Err(BankError::OutOfBounds);
        }
        match u32::try_from(offset) {
            Ok(offset) => Ok(self.base + offset),
            Err(_) => Err(BankError::OutOfBounds),
        }
    }
}

impl<F: NorFlash> FlashBank for NorBank<F> {
    fn capacity(&self) -> usize {
        self.size as usize
    }

    fn empty_byte(&self) -> u8 {
        0xFF
    }

    fn erase(&mut self) -> Result<(), BankError> {
        self.flash
            .erase(self.base, self.base + self.size)
            .map_err(|_| BankError::Erase)
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), BankError> {
        let offset = self.device_offset(offset, buf.len())?;
        self.flash.read(offset, buf).map_err(|_| BankError::Read)
    }

    fn program(&mut self, offset: usize, data: &[u8]) -> Result<(), BankError> {
        let offset = self.device_offset(offset, data.len())?;
        self.flash.write(offset, data).map_err(|_| BankError::Program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_storage::nor_flash::{
        ErrorType, NorFlashErrorKind, ReadNorFlash,
    };
    use txstore_core::TxStore;

    /// NOR device model: 16-byte erase units, byte programs that can only
    /// clear bits
    struct FakeNor<const N: usize> {
        mem: [u8; N],
    }

    impl<const N: usize> FakeNor<N> {
        fn new() -> Self {
            Self { mem: [0xFF; N] }
        }
    }

    impl<const N: usize> ErrorType for FakeNor<N> {
        type Error = NorFlashErrorKind;
    }

    impl<const N: usize> ReadNorFlash for FakeNor<N> {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > N {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            bytes.copy_from_slice(&self.mem[start..end]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            N
        }
    }

    impl<const N: usize> NorFlash for FakeNor<N> {
        const WRITE_SIZE: usize = 1;
        const ERASE_SIZE: usize = 16;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if from % 16 != 0 || to % 16 != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            if to as usize > N || from > to {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            self.mem[from as usize..to as usize].fill(0xFF);
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > N {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            for (cell, byte) in self.mem[start..end].iter_mut().zip(bytes) {
                *cell &= byte;
            }
            Ok(())
        }
    }

    /// Device with a 4-byte program unit, which cannot back a bank
    struct WideNor {
        mem: [u8; 64],
    }

    impl ErrorType for WideNor {
        type Error = NorFlashErrorKind;
    }

    impl ReadNorFlash for WideNor {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            bytes.copy_from_slice(&self.mem[start..start + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            64
        }
    }

    impl NorFlash for WideNor {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = 16;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            self.mem[from as usize..to as usize].fill(0xFF);
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            self.mem[start..start + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn test_geometry_validation() {
        assert!(NorBank::new(FakeNor::<64>::new(), 0, 32).is_ok());
        assert!(NorBank::new(FakeNor::<64>::new(), 32, 32).is_ok());

        // Zero-sized window
        assert_eq!(
            NorBank::new(FakeNor::<64>::new(), 0, 0).err(),
            Some(BankError::Geometry)
        );
        // Misaligned base and size
        assert_eq!(
            NorBank::new(FakeNor::<64>::new(), 8, 32).err(),
            Some(BankError::Geometry)
        );
        assert_eq!(
            NorBank::new(FakeNor::<64>::new(), 0, 24).err(),
            Some(BankError::Geometry)
        );
        // Window past the end of the device
        assert_eq!(
            NorBank::new(FakeNor::<64>::new(), 48, 32).err(),
            Some(BankError::Geometry)
        );
        // Not byte-programmable
        assert_eq!(
            NorBank::new(WideNor { mem: [0xFF; 64] }, 0, 32).err(),
            Some(BankError::Geometry)
        );
    }

    #[test]
    fn test_window_is_offset_and_bounded() {
        let mut bank = NorBank::new(FakeNor::<64>::new(), 16, 32).unwrap();
        assert_eq!(bank.capacity(), 32);
        assert_eq!(bank.empty_byte(), 0xFF);

        bank.program(0, &[0x12, 0x34]).unwrap();
        let mut buf = [0u8; 2];
        bank.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x34]);

        // Bank offset 0 is device offset 16; the first sector is untouched
        let mut flash = bank.release();
        let mut front = [0u8; 16];
        ReadNorFlash::read(&mut flash, 0, &mut front).unwrap();
        assert_eq!(front, [0xFF; 16]);
        let mut mapped = [0u8; 2];
        ReadNorFlash::read(&mut flash, 16, &mut mapped).unwrap();
        assert_eq!(mapped, [0x12, 0x34]);

        let mut bank = NorBank::new(flash, 16, 32).unwrap();
        assert_eq!(
            bank.program(31, &[0, 0]).err(),
            Some(BankError::OutOfBounds)
        );
        let mut buf = [0u8; 33];
        assert_eq!(bank.read(0, &mut buf).err(), Some(BankError::OutOfBounds));
    }

    #[test]
    fn test_erase_fills_window() {
        let mut bank = NorBank::new(FakeNor::<64>::new(), 0, 32).unwrap();
        bank.program(3, &[0x00, 0x11]).unwrap();
        bank.erase().unwrap();
        let mut buf = [0u8; 32];
        bank.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 32]);
    }

    #[test]
    fn test_store_runs_over_nor_banks() {
        let bank0 = NorBank::new(FakeNor::<32>::new(), 0, 32).unwrap();
        let bank1 = NorBank::new(FakeNor::<32>::new(), 0, 32).unwrap();
        let mut store = TxStore::<_, _, u16>::new(bank0, bank1, b"boot defaults\0").unwrap();

        assert_eq!(store.length().unwrap(), 14);

        // Enough writes to exhaust the first bank and switch over
        store.write(b"profile=rinse\0").unwrap();
        store.write(b"profile=spin\0").unwrap();

        let mut buf = [0u8; 32];
        let n = store.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"profile=spin\0");
    }
}
