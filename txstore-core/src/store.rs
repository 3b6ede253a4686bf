//! The transactional store engine
//!
//! Two banks form an append log for configuration records. New payloads
//! are appended to the active bank; when it cannot hold the next record,
//! the other bank is erased and becomes active. The previous record is
//! destroyed only after the new one is complete on the medium, so a power
//! cut at any instant leaves a valid payload behind.
//!
//! Startup reads byte 0 of each bank and classifies the medium:
//!
//! | bank0[0] | bank1[0] | action                                   |
//! |----------|----------|------------------------------------------|
//! | empty    | empty    | store the default payload into bank0     |
//! | record   | empty    | bank0 active, fast-forward it            |
//! | empty    | record   | bank1 active, fast-forward it            |
//! | record   | record   | bank1 active (it only gains a record once |
//! |          |          | bank0 filled up), fast-forward it        |
//! | foreign  | any      | unrecoverable: erase both, store default |
//!
//! Fast-forward walks the record log from offset 0 until the first empty
//! header slot, which is the next write position.

use core::marker::PhantomData;

use txstore_hal::{BankError, FlashBank};

use crate::record::{self, RecordLen, Slot, MAX_LEN_WIDTH};

/// Errors surfaced by [`TxStore`] operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A bank backend operation failed
    Bank(BankError),
    /// The two banks disagree on their erased-cell byte value
    EmptyByteMismatch,
    /// Payload cannot fit a single bank, or overflows the length field
    PayloadTooLarge,
    /// Destination buffer is smaller than the stored payload
    BufferTooSmall,
}

impl From<BankError> for Error {
    fn from(e: BankError) -> Self {
        Error::Bank(e)
    }
}

/// Which of the two banks a cursor refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum BankId {
    Bank0,
    Bank1,
}

impl BankId {
    fn other(self) -> Self {
        match self {
            BankId::Bank0 => BankId::Bank1,
            BankId::Bank1 => BankId::Bank0,
        }
    }
}

/// Outcome of classifying the on-medium content at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Content {
    /// Neither bank holds a record
    Empty,
    /// A record log was found and the cursors are placed
    Valid,
    /// Structural corruption; contents are unrecoverable
    Invalid,
}

/// Transactional dual-bank configuration store
///
/// Generic over the two bank backends and the length-field integer `L`
/// (the wire-format width, `u16` by default). The engine exclusively owns
/// its banks for its lifetime; use [`TxStore::into_banks`] to get them
/// back, or hand in `&mut` banks to keep ownership outside.
///
/// The default payload is stored whenever the medium is empty or
/// unrecoverable. It may be empty, in which case a zero-length record is
/// written and [`TxStore::length`] reports 0.
pub struct TxStore<'d, B0, B1, L = u16> {
    bank0: B0,
    bank1: B1,
    default_payload: &'d [u8],
    read_bank: BankId,
    read_pos: usize,
    write_bank: BankId,
    write_pos: usize,
    _len: PhantomData<L>,
}

impl<'d, B0, B1, L> TxStore<'d, B0, B1, L>
where
    B0: FlashBank,
    B1: FlashBank,
    L: RecordLen,
{
    /// Open the store over two banks
    ///
    /// Classifies the existing content and places the cursors. On empty
    /// or unrecoverable media the default payload is stored into bank0
    /// (unrecoverable content is erased first).
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyByteMismatch`] if the banks disagree on their
    ///   erased-cell value
    /// - [`Error::PayloadTooLarge`] if the default payload could never be
    ///   stored in the smaller bank; a default that cannot be written
    ///   back is rejected before any flash access
    /// - [`Error::Bank`] on backend failure
    pub fn new(bank0: B0, bank1: B1, default_payload: &'d [u8]) -> Result<Self, Error> {
        if bank0.empty_byte() != bank1.empty_byte() {
            return Err(Error::EmptyByteMismatch);
        }
        if !Self::storable(&bank0, &bank1, default_payload.len()) {
            return Err(Error::PayloadTooLarge);
        }

        let mut store = Self {
            bank0,
            bank1,
            default_payload,
            read_bank: BankId::Bank0,
            read_pos: 0,
            write_bank: BankId::Bank0,
            write_pos: 0,
            _len: PhantomData,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Length in bytes of the stored payload
    pub fn length(&mut self) -> Result<usize, Error> {
        let len = self.read_len(self.read_bank, self.read_pos + 1)?;
        Ok(len)
    }

    /// Copy the stored payload into `dst`, returning the byte count
    ///
    /// # Errors
    ///
    /// [`Error::BufferTooSmall`] if `dst` cannot hold [`TxStore::length`]
    /// bytes.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        let len = self.length()?;
        if dst.len() < len {
            return Err(Error::BufferTooSmall);
        }
        let bank = self.read_bank;
        let payload_pos = self.read_pos + 1 + L::WIDTH;
        self.read_at(bank, payload_pos, &mut dst[..len])?;
        Ok(len)
    }

    /// Copy the stored payload into an owned fixed-capacity vector
    pub fn read_vec<const N: usize>(&mut self) -> Result<heapless::Vec<u8, N>, Error> {
        let len = self.length()?;
        let mut vec = heapless::Vec::new();
        vec.resize_default(len).map_err(|_| Error::BufferTooSmall)?;
        let bank = self.read_bank;
        let payload_pos = self.read_pos + 1 + L::WIDTH;
        self.read_at(bank, payload_pos, &mut vec)?;
        Ok(vec)
    }

    /// Store a new payload
    ///
    /// Appends to the active bank when it has room; otherwise erases the
    /// other bank and appends there. Migrating back to bank0 additionally
    /// erases bank1 once the new record is complete: bank1 may only lose
    /// its stale record after bank0 holds a valid one, or a power cut
    /// in between would resurrect the stale payload at the next boot.
    ///
    /// # Errors
    ///
    /// [`Error::PayloadTooLarge`] if no single bank can hold the record;
    /// the medium and cursors are untouched in that case.
    pub fn write(&mut self, payload: &[u8]) -> Result<(), Error> {
        let needed = 1 + L::WIDTH + payload.len() + 1;
        if self.bank0.capacity().min(self.bank1.capacity()) < needed
            || payload.len() > L::MAX_LEN
        {
            debug!("payload of {} bytes exceeds bank capacity", payload.len());
            return Err(Error::PayloadTooLarge);
        }

        if self.remaining(self.write_bank, self.write_pos) >= needed {
            self.append(payload)?;
        } else {
            let target = self.write_bank.other();
            debug!("bank {} exhausted, switching to {}", self.write_bank, target);

            self.write_pos = 0;
            self.erase_bank(target)?;
            self.write_bank = target;
            self.append(payload)?;

            if target == BankId::Bank0 {
                self.erase_bank(BankId::Bank1)?;
            }
        }

        Ok(())
    }

    /// Erase both banks and store the default payload
    pub fn reset(&mut self) -> Result<(), Error> {
        debug!("resetting banks to the default payload");

        self.erase_bank(BankId::Bank0)?;
        self.erase_bank(BankId::Bank1)?;

        self.read_bank = BankId::Bank0;
        self.write_bank = BankId::Bank0;
        self.read_pos = 0;
        self.write_pos = 0;

        let default = self.default_payload;
        self.write(default)
    }

    /// Borrow the first bank, e.g. to inspect backend counters
    pub fn bank0(&self) -> &B0 {
        &self.bank0
    }

    /// Borrow the second bank
    pub fn bank1(&self) -> &B1 {
        &self.bank1
    }

    /// Tear the store down and hand the banks back
    pub fn into_banks(self) -> (B0, B1) {
        (self.bank0, self.bank1)
    }

    /// Whether a payload of `len` bytes plus terminator fits the smaller
    /// bank and the length field
    fn storable(bank0: &B0, bank1: &B1, len: usize) -> bool {
        let needed = 1 + L::WIDTH + len + 1;
        bank0.capacity().min(bank1.capacity()) >= needed && len <= L::MAX_LEN
    }

    // Both banks agree on this; checked at construction.
    fn empty_byte(&self) -> u8 {
        self.bank0.empty_byte()
    }

    fn initialize(&mut self) -> Result<(), Error> {
        match self.parse()? {
            Content::Valid => {
                debug!(
                    "found record at {}@{}, next write at {}@{}",
                    self.read_pos, self.read_bank, self.write_pos, self.write_bank
                );
                Ok(())
            }
            Content::Empty => {
                debug!("banks are empty, storing the default payload");
                let default = self.default_payload;
                self.write(default)
            }
            Content::Invalid => {
                warn!("unrecoverable bank content, resetting to the default payload");
                self.reset()
            }
        }
    }

    /// Classify both banks by their first header byte and locate the
    /// cursors in the active one
    fn parse(&mut self) -> Result<Content, Error> {
        self.read_bank = BankId::Bank0;
        self.write_bank = BankId::Bank0;
        self.read_pos = 0;
        self.write_pos = 0;

        let empty_byte = self.empty_byte();
        let header0 = Slot::classify(self.header_at(BankId::Bank0, 0)?, empty_byte);
        let header1 = Slot::classify(self.header_at(BankId::Bank1, 0)?, empty_byte);

        match (header0, header1) {
            (Slot::Empty, Slot::Empty) => Ok(Content::Empty),
            (Slot::Record, Slot::Empty) => self.fast_forward(),
            (Slot::Empty, Slot::Record) | (Slot::Record, Slot::Record) => {
                // When both banks open with a record, bank1 is the newer
                // one: it only receives a record once bank0 has filled up.
                self.read_bank = BankId::Bank1;
                self.write_bank = BankId::Bank1;
                self.fast_forward()
            }
            _ => Ok(Content::Invalid),
        }
    }

    /// Walk the active bank's record log from the read cursor to the
    /// first empty header slot
    ///
    /// Every step reserves one byte past the record for the terminating
    /// empty header that proves the record is complete and the log has a
    /// legal continuation point.
    fn fast_forward(&mut self) -> Result<Content, Error> {
        loop {
            if self.remaining(self.read_bank, self.read_pos) < 1 + L::WIDTH + 1 {
                warn!("open record at {}@{}", self.read_pos, self.read_bank);
                return Ok(Content::Invalid);
            }

            let len = self.read_len(self.read_bank, self.read_pos + 1)?;

            if self.remaining(self.read_bank, self.read_pos) < 1 + L::WIDTH + len + 1 {
                warn!(
                    "record length {} at {}@{} exceeds the bank",
                    len, self.read_pos, self.read_bank
                );
                return Ok(Content::Invalid);
            }

            self.write_pos = self.read_pos + 1 + L::WIDTH + len;

            let empty_byte = self.empty_byte();
            match Slot::classify(self.header_at(self.read_bank, self.write_pos)?, empty_byte) {
                Slot::Empty => return Ok(Content::Valid),
                Slot::Record => self.read_pos = self.write_pos,
                Slot::Foreign(value) => {
                    warn!(
                        "foreign header {} at {}@{}",
                        value, self.write_pos, self.read_bank
                    );
                    return Ok(Content::Invalid);
                }
            }
        }
    }

    /// Program one record at the write cursor and move both cursors over it
    fn append(&mut self, payload: &[u8]) -> Result<(), Error> {
        let bank = self.write_bank;
        let pos = self.write_pos;

        let mut raw = [0u8; MAX_LEN_WIDTH];
        L::encode(payload.len(), &mut raw[..L::WIDTH]);

        // Header byte goes in last: until it flips away from the erased
        // value, the slot still parses as unwritten space and the previous
        // record stays the newest valid one.
        self.program_at(bank, pos + 1, &raw[..L::WIDTH])?;
        self.program_at(bank, pos + 1 + L::WIDTH, payload)?;
        let marker = record::marker(self.empty_byte());
        self.program_at(bank, pos, &[marker])?;

        self.read_bank = bank;
        self.read_pos = pos;
        self.write_pos = pos + 1 + L::WIDTH + payload.len();

        Ok(())
    }

    fn remaining(&self, bank: BankId, pos: usize) -> usize {
        let capacity = match bank {
            BankId::Bank0 => self.bank0.capacity(),
            BankId::Bank1 => self.bank1.capacity(),
        };
        capacity - pos
    }

    fn header_at(&mut self, bank: BankId, pos: usize) -> Result<u8, BankError> {
        let mut byte = [0u8; 1];
        self.read_at(bank, pos, &mut byte)?;
        Ok(byte[0])
    }

    fn read_len(&mut self, bank: BankId, pos: usize) -> Result<usize, BankError> {
        let mut raw = [0u8; MAX_LEN_WIDTH];
        self.read_at(bank, pos, &mut raw[..L::WIDTH])?;
        Ok(L::decode(&raw[..L::WIDTH]))
    }

    fn read_at(&mut self, bank: BankId, pos: usize, buf: &mut [u8]) -> Result<(), BankError> {
        match bank {
            BankId::Bank0 => self.bank0.read(pos, buf),
            BankId::Bank1 => self.bank1.read(pos, buf),
        }
    }

    fn program_at(&mut self, bank: BankId, pos: usize, data: &[u8]) -> Result<(), BankError> {
        match bank {
            BankId::Bank0 => self.bank0.program(pos, data),
            BankId::Bank1 => self.bank1.program(pos, data),
        }
    }

    fn erase_bank(&mut self, bank: BankId) -> Result<(), BankError> {
        match bank {
            BankId::Bank0 => self.bank0.erase(),
            BankId::Bank1 => self.bank1.erase(),
        }
    }
}
