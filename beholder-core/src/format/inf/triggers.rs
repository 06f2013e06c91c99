//! The level-event trigger table.
//!
//! Triggers bind a maze position and a set of flag bits to a byte offset in
//! the script stream. The table sits past the end of the script, at the
//! offset the level header declares, so it is read as a side-channel: the
//! caller's cursor is left where it was.

use std::io::Cursor;

use binrw::BinRead;

use crate::format::{FormatError, Result};

/// The 12 flag combinations the engine knows how to handle, collapsed to the
/// class index its dispatch uses.
const FLAG_CLASSES: [(u8, i8); 12] = [
    (0x00, 0),
    (0x08, 1),
    (0x18, 2),
    (0x20, 3),
    (0x28, 4),
    (0x40, 5),
    (0x48, 6),
    (0x60, 7),
    (0x78, 8),
    (0x80, 9),
    (0x88, 10),
    (0xa8, 11),
];

/// Collapsed-flag value for combinations outside the known set. Kept instead
/// of failing the load: such triggers do occur in shipped levels.
pub const UNKNOWN_FLAG_CLASS: i8 = -1;

fn collapse_flags(flags: u8) -> i8 {
    FLAG_CLASSES
        .iter()
        .find(|(raw, _)| *raw == flags)
        .map_or(UNKNOWN_FLAG_CLASS, |(_, class)| *class)
}

#[derive(BinRead, Debug)]
#[br(little)]
struct RawTrigger {
    position: u16,
    flags: u8,
    address: u16,
}

/// A level-event descriptor: where on the map it fires, under which flag
/// bits, and where in the script stream its handler starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub x: u16,
    pub y: u16,
    pub flags: u8,
    pub collapsed_flags: i8,
    pub address: u16,
}

impl From<RawTrigger> for Trigger {
    fn from(raw: RawTrigger) -> Self {
        Self {
            x: raw.position & 31,
            y: raw.position >> 5,
            flags: raw.flags,
            collapsed_flags: collapse_flags(raw.flags),
            address: raw.address,
        }
    }
}

/// All triggers of a level, sorted ascending by `(y, x)`. Immutable after
/// load.
#[derive(Debug, Default)]
pub struct TriggerTable {
    triggers: Vec<Trigger>,
}

impl TriggerTable {
    /// Reads the table at `table_offset`: a `u16` record count followed by
    /// that many 5-byte records. The cursor is restored afterward.
    pub fn load(cur: &mut Cursor<&[u8]>, table_offset: u16) -> Result<Self> {
        let saved = cur.position();
        cur.set_position(table_offset as u64);

        let result = Self::read_records(cur);
        cur.set_position(saved);

        let mut triggers = result?;
        triggers.sort_by_key(|t| (t.y, t.x));
        Ok(Self { triggers })
    }

    fn read_records(cur: &mut Cursor<&[u8]>) -> Result<Vec<Trigger>> {
        let count = u16::read_le(cur).map_err(|_| overflow(cur))?;

        let mut triggers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = RawTrigger::read(cur).map_err(|_| overflow(cur))?;
            triggers.push(raw.into());
        }
        Ok(triggers)
    }

    /// Triggers in `(y, x)` order.
    pub fn iter(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Finds the trigger whose handler starts at `address`, along with its
    /// index in the sorted table.
    pub fn find_by_address(&self, address: u16) -> Option<(usize, &Trigger)> {
        self.triggers
            .iter()
            .enumerate()
            .find(|(_, t)| t.address == address)
    }
}

fn overflow(cur: &Cursor<&[u8]>) -> FormatError {
    FormatError::Overflow {
        offset: cur.position() as usize,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{TriggerTable, UNKNOWN_FLAG_CLASS};
    use crate::format::FormatError;

    fn record(x: u16, y: u16, flags: u8, address: u16) -> Vec<u8> {
        let mut out = ((y << 5) | x).to_le_bytes().to_vec();
        out.push(flags);
        out.extend_from_slice(&address.to_le_bytes());
        out
    }

    #[test]
    fn load_sorts_and_restores_the_cursor() {
        let mut data = vec![0u8; 8]; // the table offset need not be at 0
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend_from_slice(&record(5, 2, 0x18, 0x100));
        data.extend_from_slice(&record(1, 2, 0x42, 0x200));
        data.extend_from_slice(&record(9, 0, 0x00, 0x300));

        let mut cur = Cursor::new(data.as_slice());
        cur.set_position(3);
        let table = TriggerTable::load(&mut cur, 8).unwrap();
        assert_eq!(cur.position(), 3);

        let order: Vec<_> = table.iter().map(|t| (t.x, t.y)).collect();
        assert_eq!(order, [(9, 0), (1, 2), (5, 2)]);

        let (index, known) = table.find_by_address(0x100).unwrap();
        assert_eq!(index, 2);
        assert_eq!(known.collapsed_flags, 2);

        let (_, unknown) = table.find_by_address(0x200).unwrap();
        assert_eq!(unknown.collapsed_flags, UNKNOWN_FLAG_CLASS);
    }

    #[test]
    fn truncated_table_is_overflow() {
        let mut data = 2u16.to_le_bytes().to_vec();
        data.extend_from_slice(&record(0, 0, 0, 0));

        let mut cur = Cursor::new(data.as_slice());
        assert!(matches!(
            TriggerTable::load(&mut cur, 0),
            Err(FormatError::Overflow { .. })
        ));
    }
}
