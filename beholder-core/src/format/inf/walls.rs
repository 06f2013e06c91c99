//! The standard wall-mapping set shared by every level.
//!
//! Levels only carry decoration commands for the walls they customize; the
//! first 23 mapping slots are the stock walls every level starts from.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

/// Binds a wall-mapping index to a wall set, an optional decoration and the
/// event/flag bits the engine consults when the party interacts with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WallMapping {
    pub index: u8,
    pub wall_set: u8,
    pub decoration: u8,
    pub event_mask: u8,
    pub flags: u8,
    /// Image resource the decoration is drawn from, set by `0xec` commands.
    pub cps_name: String,
    /// Placement-table resource paired with it.
    pub dat_name: String,
}

const WALL_SET: [u8; 23] = [
    0, 1, 2, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3,
];
const EVENT_MASK: [u8; 23] = [
    0, 0, 0, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0,
];
const FLAGS: [u8; 23] = [
    0x01, 0x04, 0x04, 0x2c, 0x2c, 0x2c, 0x2c, 0x19, 0x2c, 0x2c, 0x2c, 0x2c, 0x19, 0x2e, 0x2e,
    0x2e, 0x2e, 0x19, 0x2e, 0x2e, 0x2e, 0x2e, 0x19,
];

/// The prefilled standard walls, keyed by mapping index. Initialized once,
/// never mutated; levels clone it and overlay their own mappings on top.
pub(crate) static STANDARD_WALL_MAPPINGS: Lazy<BTreeMap<u8, WallMapping>> = Lazy::new(|| {
    (0..WALL_SET.len())
        .map(|i| {
            let mapping = WallMapping {
                index: i as u8,
                wall_set: WALL_SET[i],
                decoration: 0xff,
                event_mask: EVENT_MASK[i],
                flags: FLAGS[i],
                cps_name: String::new(),
                dat_name: String::new(),
            };
            (i as u8, mapping)
        })
        .collect()
});

#[cfg(test)]
mod tests {
    use super::STANDARD_WALL_MAPPINGS;

    #[test]
    fn standard_walls_are_prefilled() {
        assert_eq!(STANDARD_WALL_MAPPINGS.len(), 23);

        let open = &STANDARD_WALL_MAPPINGS[&0];
        assert_eq!((open.wall_set, open.event_mask, open.flags), (0, 0, 0x01));

        let door = &STANDARD_WALL_MAPPINGS[&7];
        assert_eq!((door.wall_set, door.event_mask, door.flags), (3, 1, 0x19));

        // no standard wall carries a decoration
        assert!(STANDARD_WALL_MAPPINGS.values().all(|m| m.decoration == 0xff));
    }
}
