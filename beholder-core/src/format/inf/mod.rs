//! Support for the level-script resource, storing everything a level needs
//! beyond its geometry: resource names, monsters, wall mappings, the event
//! scripts and the trigger table binding map squares to script handlers.
//!
//! The resource arrives wrapped in the compressed envelope (see
//! [`super::cps`]); this module consumes the decompressed buffer.

pub mod decompiler;
pub mod stack;
pub mod triggers;
pub mod walls;

use std::collections::BTreeMap;
use std::io::{Cursor, Read as _};

use binrw::BinRead;
use bytes::Bytes;
use itertools::Itertools as _;
use tracing::trace;

use crate::format::cps::Cps;
use crate::format::inf::decompiler::{Decompilation, Decompiler};
use crate::format::inf::triggers::TriggerTable;
use crate::format::inf::walls::{WallMapping, STANDARD_WALL_MAPPINGS};
use crate::format::{FormatError, Result};

/// A monster placement record from the level header.
#[derive(BinRead, Debug, Clone, PartialEq, Eq)]
#[br(little)]
pub struct Monster {
    pub index: u8,
    pub level_type: u8,
    pub position: u16,
    pub subposition: u8,
    pub direction: u8,
    pub kind: u8,
    pub picture: u8,
    pub phase: u8,
    pub pause: u8,
    pub weapon: u16,
    pub pocket_item: u16,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct RawHeader {
    trigger_offset: u16,
    maze_name: [u8; 12],
    tileset_name: [u8; 12],
    palette_name: [u8; 12],
    _unknown1: [u8; 4],
    timer_command: u8,
    timer_ticks: u16,
    timer_steps: u16,
    monster1_compression: u8,
    monster1_name: [u8; 12],
    monster2_compression: u8,
    monster2_name: [u8; 12],
    _unknown2: [u8; 5],
    #[br(count = 30)]
    monsters: Vec<Monster>,
    decoration_command_count: u16,
}

/// One of the two monster-graphics slots a level can load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonsterGraphics {
    pub name: String,
    pub compression: u8,
}

/// A parsed level-script resource.
pub struct Inf {
    pub maze_name: String,
    pub tileset_name: String,
    pub palette_name: String,
    pub timer_command: u8,
    pub timer_ticks: u16,
    pub timer_steps: u16,
    pub monster_graphics: [MonsterGraphics; 2],
    pub monsters: Vec<Monster>,
    pub wall_mappings: BTreeMap<u8, WallMapping>,
    trigger_offset: u16,
    script_start: usize,
    triggers: TriggerTable,
    data: Bytes,
}

impl Inf {
    /// Decompresses a level-script file and parses it.
    pub fn from_cps_bytes(data: &[u8]) -> Result<Self> {
        let cps = Cps::from_bytes(data)?;
        Self::new(Bytes::from(cps.into_data()))
    }

    /// Parses an already-decompressed level-script buffer.
    pub fn new(data: Bytes) -> Result<Self> {
        let mut cur = Cursor::new(&data[..]);
        let header = RawHeader::read(&mut cur).map_err(|_| overflow(&cur))?;
        trace!(
            trigger_offset = header.trigger_offset,
            decoration_commands = header.decoration_command_count,
            "parsed level-script header"
        );

        let wall_mappings = load_decorations(&mut cur, header.decoration_command_count)?;
        let script_start = cur.position() as usize;

        let triggers = TriggerTable::load(&mut cur, header.trigger_offset)?;

        Ok(Self {
            maze_name: resource_name(&header.maze_name),
            tileset_name: resource_name(&header.tileset_name),
            palette_name: resource_name(&header.palette_name),
            timer_command: header.timer_command,
            timer_ticks: header.timer_ticks,
            timer_steps: header.timer_steps,
            monster_graphics: [
                MonsterGraphics {
                    name: resource_name(&header.monster1_name),
                    compression: header.monster1_compression,
                },
                MonsterGraphics {
                    name: resource_name(&header.monster2_name),
                    compression: header.monster2_compression,
                },
            ],
            monsters: header.monsters,
            wall_mappings,
            trigger_offset: header.trigger_offset,
            script_start,
            triggers,
            data,
        })
    }

    pub fn triggers(&self) -> &TriggerTable {
        &self.triggers
    }

    /// Offset of the first script instruction, right behind the decoration
    /// commands.
    pub fn script_start(&self) -> usize {
        self.script_start
    }

    /// Offset of the trigger table, which doubles as the script stream's
    /// upper bound.
    pub fn trigger_offset(&self) -> u16 {
        self.trigger_offset
    }

    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    pub fn find_wall_mapping(&self, index: u8) -> Option<&WallMapping> {
        self.wall_mappings.get(&index)
    }

    /// Names of the decoration image resources the level references.
    pub fn decoration_resources(&self) -> Vec<&str> {
        self.wall_mappings
            .values()
            .map(|m| m.cps_name.as_str())
            .filter(|name| !name.is_empty())
            .unique()
            .collect()
    }

    /// Decompiles the script region into pseudo-assembly and branch records.
    pub fn decompile(&self) -> Result<Decompilation> {
        Decompiler::new(
            &self.data,
            self.script_start,
            self.trigger_offset,
            &self.triggers,
        )
        .run()
    }
}

/// Scans the decoration commands in front of the script region. Only two of
/// them matter here: `0xec` switches the current decoration resource pair,
/// `0xfb` overlays one wall mapping. Everything else is left to the script
/// decompiler (the count covers bytes it will revisit).
fn load_decorations(cur: &mut Cursor<&[u8]>, count: u16) -> Result<BTreeMap<u8, WallMapping>> {
    let mut mappings = STANDARD_WALL_MAPPINGS.clone();
    let mut cps_name = String::new();
    let mut dat_name = String::new();

    for _ in 0..count {
        let command = read_u8(cur)?;
        match command {
            0xec => {
                cps_name = read_resource_name(cur)?;
                dat_name = read_resource_name(cur)?;
                trace!(%cps_name, %dat_name, "decoration resource pair");
            }
            0xfb => {
                let index = read_u8(cur)?;
                let wall_set = read_u8(cur)?;
                let decoration = read_u8(cur)?;
                let event_mask = read_u8(cur)?;
                let flags = read_u8(cur)?;
                mappings.insert(
                    index,
                    WallMapping {
                        index,
                        wall_set,
                        decoration,
                        event_mask,
                        flags,
                        cps_name: cps_name.clone(),
                        dat_name: dat_name.clone(),
                    },
                );
            }
            _ => {}
        }
    }

    Ok(mappings)
}

/// Decodes a 12-byte NUL-padded resource name.
fn resource_name(raw: &[u8; 12]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn read_u8(cur: &mut Cursor<&[u8]>) -> Result<u8> {
    u8::read_le(cur).map_err(|_| overflow(cur))
}

fn read_resource_name(cur: &mut Cursor<&[u8]>) -> Result<String> {
    let mut raw = [0u8; 12];
    cur.read_exact(&mut raw).map_err(|_| overflow(cur))?;
    Ok(resource_name(&raw))
}

fn overflow(cur: &Cursor<&[u8]>) -> FormatError {
    FormatError::Overflow {
        offset: cur.position() as usize,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::Inf;
    use crate::format::FormatError;

    const MONSTER_RECORD_LEN: usize = 14;
    const HEADER_LEN: usize = 2 + 3 * 12 + 4 + 1 + 2 + 2 + 13 + 13 + 5 + 30 * MONSTER_RECORD_LEN + 2;

    fn name12(name: &str) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[..name.len()].copy_from_slice(name.as_bytes());
        out
    }

    /// Builds a minimal level: one decoration pair, one wall-mapping
    /// overlay, a one-instruction script and a single trigger.
    fn level_fixture() -> Vec<u8> {
        let mut data = vec![0u8; HEADER_LEN];
        data[2..14].copy_from_slice(&name12("LEVEL1.MAZ"));
        data[14..26].copy_from_slice(&name12("DUNGEON.VCN"));
        data[26..38].copy_from_slice(&name12("DUNGEON.PAL"));

        // decoration commands
        data[HEADER_LEN - 2..].copy_from_slice(&2u16.to_le_bytes());
        data.push(0xec);
        data.extend_from_slice(&name12("DOOR.CPS"));
        data.extend_from_slice(&name12("DOOR.DAT"));
        data.extend_from_slice(&[0xfb, 24, 2, 7, 1, 0x2c]);

        // script region: a single Abort event
        let script_start = data.len();
        data.push(0xf1);

        // trigger table
        let trigger_offset = data.len() as u16;
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&((4u16 << 5) | 9).to_le_bytes()); // [9,4]
        data.push(0x08);
        data.extend_from_slice(&(script_start as u16).to_le_bytes());

        data[0..2].copy_from_slice(&trigger_offset.to_le_bytes());
        data
    }

    #[test]
    fn header_names_are_nul_trimmed() {
        let inf = Inf::new(Bytes::from(level_fixture())).unwrap();
        assert_eq!(inf.maze_name, "LEVEL1.MAZ");
        assert_eq!(inf.tileset_name, "DUNGEON.VCN");
        assert_eq!(inf.palette_name, "DUNGEON.PAL");
        assert_eq!(inf.monsters.len(), 30);
    }

    #[test]
    fn wall_mappings_overlay_the_standard_set() {
        let inf = Inf::new(Bytes::from(level_fixture())).unwrap();
        assert_eq!(inf.wall_mappings.len(), 24);

        let overlay = inf.find_wall_mapping(24).unwrap();
        assert_eq!(overlay.wall_set, 2);
        assert_eq!(overlay.decoration, 7);
        assert_eq!(overlay.cps_name, "DOOR.CPS");
        assert_eq!(overlay.dat_name, "DOOR.DAT");

        // the standard set is untouched underneath
        assert_eq!(inf.find_wall_mapping(0).unwrap().flags, 0x01);
        assert_eq!(inf.decoration_resources(), ["DOOR.CPS"]);
    }

    #[test]
    fn script_region_decompiles_with_trigger_banner() {
        let inf = Inf::new(Bytes::from(level_fixture())).unwrap();
        assert_eq!(inf.script_start(), HEADER_LEN + 31);

        let result = inf.decompile().unwrap();
        assert!(result.text.contains("; Referenced by trigger $00. Pos:[9,4]"));
        assert!(result.text.contains("Abort event"));
    }

    #[test]
    fn truncated_header_is_overflow() {
        let err = Inf::new(Bytes::from(vec![0u8; 64])).err().unwrap();
        assert!(matches!(err, FormatError::Overflow { .. }));
    }
}
