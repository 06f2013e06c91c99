//! The level-script decompiler.
//!
//! Walks the instruction stream byte-by-byte from the code region up to the
//! trigger-table offset (the stream's upper bound), reconstructing annotated
//! pseudo-assembly and the branch records the reassembler consumes.
//!
//! The downstream encoding only has forward, single-byte-relative
//! displacements, which is why backward jump and conditional targets must
//! fail loudly instead of wrapping, and why every emitted branch comes with
//! a range assert.

use std::fmt::Write as _;

use snafu::ensure;

use crate::format::{
    IllegalBranchSnafu, OverflowSnafu, Result, StackImbalanceSnafu, UnknownOpcodeSnafu,
    inf::stack::SimulatedStack,
    inf::triggers::{Trigger, TriggerTable},
};

/// How far past an unknown opcode a caller must skip before explicitly
/// restarting the stream.
pub const RESUME_SKIP: u16 = 16;

/// How a branch behaves once the conditional feeding it is folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Taken unconditionally (also used for plain jumps).
    AlwaysTrue,
    /// Never taken; the guarded block is dead.
    AlwaysFalse,
    /// Depends on runtime state.
    Dynamic,
}

/// A decoded jump or conditional, addressed in script-stream offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchRecord {
    pub source: u16,
    pub target: u16,
    pub kind: BranchKind,
}

/// The decompiler's output: the pseudo-assembly listing plus the branch
/// records for relocation.
#[derive(Debug)]
pub struct Decompilation {
    pub text: String,
    pub branches: Vec<BranchRecord>,
}

/// Mnemonic for a top-level opcode, if the instruction set defines it.
pub fn mnemonic(opcode: u8) -> Option<&'static str> {
    Some(match opcode {
        0xff => "SetWall",
        0xfe => "ChangeWall",
        0xfd => "OpenDoor",
        0xfc => "CloseDoor",
        0xfb => "CreateMonster",
        0xfa => "Teleport",
        0xf9 => "StealSmallItems",
        0xf8 => "Message",
        0xf7 => "SetFlag",
        0xf6 => "Sound",
        0xf5 => "ClearFlag",
        0xf4 => "Heal",
        0xf3 => "Damage",
        0xf2 => "Jump",
        0xf1 => "EndEvent",
        0xf0 => "Return",
        0xef => "Call",
        0xee => "Conditional",
        0xed => "ConsumeItem",
        0xec => "ChangeLevel",
        0xeb => "GiveExperience",
        0xea => "NewItem",
        0xe9 => "Launcher",
        0xe8 => "Turn",
        0xe7 => "IdentifyAllItems",
        0xe6 => "Encounter",
        0xe5 => "Wait",
        0xe4 => "UpdateScreen",
        0xe3 => "TextMenu",
        0xe2 => "SpecialWindowPictures",
        _ => return None,
    })
}

macro_rules! out {
    ($dec:expr, $($arg:tt)*) => {{
        let _ = write!($dec.out, $($arg)*);
    }};
}

macro_rules! outln {
    ($dec:expr, $($arg:tt)*) => {{
        let _ = writeln!($dec.out, $($arg)*);
    }};
}

pub struct Decompiler<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    triggers: &'a TriggerTable,
    out: String,
    branches: Vec<BranchRecord>,
}

impl<'a> Decompiler<'a> {
    /// `data` is the whole decompressed level-script buffer; decoding starts
    /// at `start` and stops at `trigger_offset`.
    pub fn new(
        data: &'a [u8],
        start: usize,
        trigger_offset: u16,
        triggers: &'a TriggerTable,
    ) -> Self {
        Self {
            data,
            pos: start,
            end: trigger_offset as usize,
            triggers,
            out: String::new(),
            branches: Vec::new(),
        }
    }

    pub fn run(mut self) -> Result<Decompilation> {
        while self.pos < self.end {
            self.instruction()?;
        }
        Ok(Decompilation {
            text: self.out,
            branches: self.branches,
        })
    }

    fn byte(&mut self) -> Result<u8> {
        match self.data.get(self.pos) {
            Some(&byte) => {
                self.pos += 1;
                Ok(byte)
            }
            None => OverflowSnafu { offset: self.pos }.fail(),
        }
    }

    fn word(&mut self) -> Result<u16> {
        ensure!(
            self.pos + 2 <= self.data.len(),
            OverflowSnafu { offset: self.pos }
        );
        let word = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(word)
    }

    /// Reads a packed map coordinate: `x = packed & 31`, `y = packed >> 5`.
    fn position(&mut self) -> Result<(u16, u16)> {
        let packed = self.word()?;
        Ok((packed & 31, packed >> 5))
    }

    fn instruction(&mut self) -> Result<()> {
        let start = self.pos;
        let trigger = self.cross_reference(start);

        out!(self, "_0x{start:04x}: ;");
        let opcode = self.byte()?;
        match opcode {
            0xff => self.set_wall()?,
            0xfe => self.change_wall()?,
            0xfd => self.door("OpenDoor")?,
            0xfc => self.door("CloseDoor")?,
            0xfb => self.create_monster()?,
            0xfa => self.teleport()?,
            0xf9 => self.steal_small_items()?,
            0xf8 => self.message()?,
            0xf7 => self.flag_op("SetFlag")?,
            0xf6 => self.sound()?,
            0xf5 => self.flag_op("ClearFlag")?,
            0xf4 => outln!(self, "Heal"),
            0xf3 => self.damage()?,
            0xf2 => self.jump(start)?,
            0xf1 => outln!(self, "Abort event"),
            0xf0 => outln!(self, "Return"),
            0xef => self.call()?,
            0xee => self.conditional(start)?,
            0xed => self.consume_item()?,
            0xec => self.change_level(trigger)?,
            0xeb => self.give_experience()?,
            0xea => self.new_item()?,
            0xe9 => self.launcher()?,
            0xe8 => self.turn()?,
            0xe7 => self.identify_all_items()?,
            0xe6 => self.encounter()?,
            0xe5 => self.wait()?,
            0xe4 => outln!(self, "UpdateScreen"),
            0xe3 => outln!(self, "TextMenu"),
            0xe2 => outln!(self, "SpecialWindowPictures"),
            _ => {
                return UnknownOpcodeSnafu {
                    opcode,
                    offset: start,
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Emits the cross-reference banner when a trigger's handler starts at
    /// `offset`, and hands the trigger to the instruction being decoded.
    fn cross_reference(&mut self, offset: usize) -> Option<&'a Trigger> {
        let triggers: &'a TriggerTable = self.triggers;
        let (index, trigger) = triggers.find_by_address(offset as u16)?;

        out!(self, "\n\n\n");
        outln!(
            self,
            "; --------------------------------------------------------------------"
        );
        out!(
            self,
            "; Referenced by trigger ${index:02x}. Pos:[{},{}] Flags: ",
            trigger.x,
            trigger.y
        );
        for bit in (0..8).rev() {
            out!(self, "{} ", (trigger.flags >> bit) & 1 != 0);
        }
        outln!(self, "");
        outln!(
            self,
            "; --------------------------------------------------------------------"
        );
        Some(trigger)
    }

    fn set_wall(&mut self) -> Result<()> {
        outln!(self, "SetWall");
        outln!(self, ";{{");
        let sub = self.byte()?;
        match sub {
            0xf7 => {
                outln!(self, ";   Type = Change all sides");
                let (x, y) = self.position()?;
                let to = self.byte()?;
                outln!(self, ";   Position = [{x},{y}]");
                outln!(self, ";   Change to = {to}");
            }
            0xe9 => {
                outln!(self, ";   Type = Change one side");
                let (x, y) = self.position()?;
                let side = self.byte()?;
                let to = self.byte()?;
                outln!(self, ";   Position = [{x},{y}]");
                outln!(self, ";   Side = {side}");
                outln!(self, ";   Change to = {to}");
            }
            0xed => {
                outln!(self, ";   Type = Change party direction");
                let direction = self.byte()?;
                outln!(self, ";   Direction = {direction}");
            }
            // other sub-types carry no operands
            _ => {}
        }
        outln!(self, ";}}");
        Ok(())
    }

    fn change_wall(&mut self) -> Result<()> {
        outln!(self, "ChangeWall");
        outln!(self, ";{{");
        let sub = self.byte()?;
        match sub {
            0xf7 => {
                outln!(self, ";   Type = Change all sides");
                let (x, y) = self.position()?;
                let to = self.byte()?;
                let from = self.byte()?;
                outln!(self, ";   Position = [{x},{y}]");
                outln!(self, ";   Change from = {from}");
                outln!(self, ";   Change to = {to}");
            }
            0xe9 => {
                outln!(self, ";   Type = Change one side");
                let (x, y) = self.position()?;
                let side = self.byte()?;
                let to = self.byte()?;
                let from = self.byte()?;
                outln!(self, ";   Position = [{x},{y}]");
                outln!(self, ";   Side = {side}");
                outln!(self, ";   Change from = {from}");
                outln!(self, ";   Change to = {to}");
            }
            0xea => {
                outln!(self, ";   Type = Open door");
                let (x, y) = self.position()?;
                outln!(self, ";   Position = [{x},{y}]");
            }
            _ => {}
        }
        outln!(self, ";}}");
        Ok(())
    }

    fn door(&mut self, name: &str) -> Result<()> {
        outln!(self, "{name}");
        outln!(self, ";{{");
        let (x, y) = self.position()?;
        outln!(self, ";   Position = [{x},{y}]");
        outln!(self, ";}}");
        Ok(())
    }

    fn create_monster(&mut self) -> Result<()> {
        outln!(self, "CreateMonster");
        outln!(self, ";{{");
        self.byte()?; // lead byte is not used by the engine
        let move_time = self.byte()?;
        let (x, y) = self.position()?;
        let subpos = self.byte()?;
        let direction = self.byte()?;
        let kind = self.byte()?;
        let picture = self.byte()?;
        let phase = self.byte()?;
        let pause = self.byte()?;
        let pocket = self.word()?;
        let weapon = self.word()?;
        outln!(self, ";   Move time = {move_time}");
        outln!(self, ";   Position = [{x},{y}:{subpos}]");
        outln!(self, ";   Direction = {direction}");
        outln!(self, ";   Type = {kind}");
        outln!(self, ";   Pic = {picture}");
        outln!(self, ";   Phase = {phase}");
        outln!(self, ";   Pause = {pause}");
        outln!(self, ";   Pocket = {pocket}");
        outln!(self, ";   Weapon = {weapon}");
        outln!(self, ";}}");
        Ok(())
    }

    fn teleport(&mut self) -> Result<()> {
        outln!(self, "Teleport");
        outln!(self, ";{{");
        let sub = self.byte()?;
        match sub {
            0xe8 => {
                self.word()?; // the party has no source square
                let (x, y) = self.position()?;
                outln!(self, ";   Type = Party");
                outln!(self, ";   Dest = [{x},{y}]");
            }
            0xf3 | 0xf5 => {
                let (sx, sy) = self.position()?;
                let (dx, dy) = self.position()?;
                let name = if sub == 0xf3 { "Monster" } else { "Item" };
                outln!(self, ";   Type = {name}");
                outln!(self, ";   Source = [{sx},{sy}]");
                outln!(self, ";   Dest = [{dx},{dy}]");
            }
            _ => {
                let (sx, sy) = self.position()?;
                let (dx, dy) = self.position()?;
                outln!(self, ";   Type = Unknown (${sub:02x})");
                outln!(self, ";   Source = [{sx},{sy}]");
                outln!(self, ";   Dest = [{dx},{dy}]");
            }
        }
        outln!(self, ";}}");
        Ok(())
    }

    fn steal_small_items(&mut self) -> Result<()> {
        outln!(self, "StealSmallItems");
        outln!(self, ";{{");
        let whom = self.byte()?;
        if whom == 0xff {
            outln!(self, ";   Whom = Random");
        } else {
            outln!(self, ";   Whom = Member {whom}");
        }
        let (x, y) = self.position()?;
        let subpos = self.byte()?;
        outln!(self, ";   Drop position = [{x},{y}:{subpos}]");
        outln!(self, ";}}");
        Ok(())
    }

    fn message(&mut self) -> Result<()> {
        let mut text = Vec::new();
        loop {
            let byte = self.byte()?;
            if byte == 0 {
                break;
            }
            text.push(byte);
        }
        let color = self.byte()?;
        self.byte()?; // one pad byte follows the color
        outln!(
            self,
            "Message: {} Color: {color}",
            String::from_utf8_lossy(&text)
        );
        Ok(())
    }

    fn flag_op(&mut self, name: &str) -> Result<()> {
        outln!(self, "{name}");
        outln!(self, ";{{");
        let target = self.byte()?;
        match target {
            0xef => {
                outln!(self, ";   Target = Maze");
                let flag = self.byte()?;
                outln!(self, ";   Flag = {flag}");
            }
            0xf0 => {
                outln!(self, ";   Target = Global");
                let flag = self.byte()?;
                outln!(self, ";   Flag = {flag}");
            }
            0xf3 => {
                outln!(self, ";   Target = Monster");
                let monster = self.byte()?;
                let flag = self.byte()?;
                outln!(self, ";   Monster = {monster}");
                outln!(self, ";   Flag = {flag}");
            }
            0xe4 => outln!(self, ";   Target = Event"),
            0xd1 => outln!(self, ";   Target = Party_Function(FUNC_SETVAL, PARTY_SAVEREST, 0)"),
            _ => {}
        }
        outln!(self, ";}}");
        Ok(())
    }

    fn sound(&mut self) -> Result<()> {
        outln!(self, "Sound");
        outln!(self, ";{{");
        let id = self.byte()?;
        let packed = self.word()?;
        outln!(self, ";   ID: ${id:02x}");
        if packed > 0 {
            outln!(self, ";   Position: [{},{}]", packed & 31, packed >> 5);
        }
        outln!(self, ";}}");
        Ok(())
    }

    fn damage(&mut self) -> Result<()> {
        outln!(self, "Damage");
        outln!(self, ";{{");
        let whom = self.byte()?;
        let flag1 = self.byte()?;
        let flag2 = self.byte()?;
        let flag3 = self.byte()?;
        if whom == 0xff {
            outln!(self, ";   Whom = All");
        } else {
            outln!(self, ";   Whom = Member {whom}");
        }
        outln!(self, ";   Flag1 = 0x{flag1:02x}");
        outln!(self, ";   Flag2 = 0x{flag2:02x}");
        outln!(self, ";   Flag3 = 0x{flag3:02x}");
        outln!(self, ";}}");
        Ok(())
    }

    fn jump(&mut self, start: usize) -> Result<()> {
        let target = self.word()?;
        ensure!(
            (target as usize) > start,
            IllegalBranchSnafu {
                offset: start,
                target
            }
        );
        outln!(self, "jump 0x{target:04x}");
        outln!(
            self,
            ".assert _0x{target:04x} - * <= 255, error, \"Illegal branch\""
        );
        outln!(self, ".byte $f2, <(_0x{target:04x} - *)");
        self.branches.push(BranchRecord {
            source: start as u16,
            target,
            kind: BranchKind::AlwaysTrue,
        });
        Ok(())
    }

    fn call(&mut self) -> Result<()> {
        let address = self.word()?;
        outln!(self, "Call 0x{address:04x}");
        outln!(self, ".byte $ef,<_0x{address:04x},>_0x{address:04x}");
        Ok(())
    }

    fn consume_item(&mut self) -> Result<()> {
        outln!(self, "ConsumeItem");
        outln!(self, ";{{");
        let location = self.byte()?;
        match location {
            0xff => outln!(self, ";   Location = Mouse pointer"),
            0xfe => {
                let (x, y) = self.position()?;
                outln!(self, ";   Position = [{x},{y}:*]");
            }
            _ => {
                let (x, y) = self.position()?;
                outln!(self, ";   Position = [{x},{y}]. Item.type=${location:02x}");
            }
        }
        outln!(self, ";}}");
        Ok(())
    }

    fn change_level(&mut self, trigger: Option<&Trigger>) -> Result<()> {
        outln!(self, "ChangeLevel");
        outln!(self, ";{{");
        let sub = self.byte()?;
        if sub == 0xe5 {
            outln!(self, ";   Type = Real level change");
            let level = self.byte()?;
            let (x, y) = self.position()?;
            let direction = self.byte()?;
            outln!(self, ";   Target =   X:{x}");
            outln!(self, ";              Y:{y}");
            outln!(self, ";            Dir:{direction}");
            outln!(self, ";            Lvl:{level}");
            outln!(self, ";}}");

            // A plain hole: falling one level down through the trigger's own
            // square gets its own byte code downstream.
            // TODO: thread the actual level index through once callers track it
            let current_level = 0;
            if let Some(trigger) = trigger {
                if level == current_level + 1
                    && direction == 255
                    && (x, y) == (trigger.x, trigger.y)
                {
                    outln!(self, ".byte $e4 ; fall through to the level below");
                }
            }
        } else {
            outln!(self, ";   Type = Inter level change");
            let direction = self.byte()?;
            let (x, y) = self.position()?;
            outln!(self, ";   Target =   X:{x}");
            outln!(self, ";              Y:{y}");
            outln!(self, ";            Dir:{direction}");
            outln!(self, ";}}");
        }
        Ok(())
    }

    fn give_experience(&mut self) -> Result<()> {
        outln!(self, "GiveExperience");
        outln!(self, ";{{");
        let sub = self.byte()?;
        if sub == 0xe2 {
            let amount = self.word()?;
            outln!(self, ";   Type = Party");
            outln!(self, ";   Amount = {amount}");
        } else {
            outln!(self, ";   Type = Unknown (0x{sub:02x})");
        }
        outln!(self, ";}}");
        Ok(())
    }

    fn new_item(&mut self) -> Result<()> {
        outln!(self, "NewItem");
        outln!(self, ";{{");
        let item = self.word()?;
        let packed = self.word()?;
        let subpos = self.byte()?;
        outln!(self, ";   Item# = ${item:04x}");
        if packed != 0xffff {
            outln!(
                self,
                ";   Position = [{},{}:{subpos}]",
                packed & 31,
                packed >> 5
            );
        } else {
            outln!(self, ";   Position = n/a");
        }
        outln!(self, ";}}");
        Ok(())
    }

    fn launcher(&mut self) -> Result<()> {
        outln!(self, "Launcher");
        outln!(self, ";{{");
        let kind = self.byte()?;
        let item = self.word()?;
        let (x, y) = self.position()?;
        let direction = self.byte()?;
        let subpos = self.byte()?;
        let name = if kind == 0xdf { "Spell" } else { "Item" };
        outln!(self, ";   Kind = {name}");
        outln!(self, ";   Item#/Spell# = {item}");
        outln!(self, ";   Pos = [{x},{y}:{subpos}]");
        outln!(self, ";   Direction = {direction}");
        outln!(self, ";}}");
        Ok(())
    }

    fn turn(&mut self) -> Result<()> {
        outln!(self, "Turn");
        outln!(self, ";{{");
        let sub = self.byte()?;
        let direction = self.byte()?;
        match sub {
            0xf1 => outln!(self, ";   Type = Party (0x{sub:02x})"),
            0xf5 => outln!(self, ";   Type = Item (0x{sub:02x})"),
            _ => outln!(self, ";   Type = Unknown (0x{sub:02x})"),
        }
        outln!(self, ";   Direction = {direction}");
        outln!(self, ";}}");
        Ok(())
    }

    fn identify_all_items(&mut self) -> Result<()> {
        outln!(self, "IdentAllItems");
        outln!(self, ";{{");
        let (x, y) = self.position()?;
        outln!(self, ";   Position = [{x},{y}]");
        outln!(self, ";}}");
        Ok(())
    }

    fn encounter(&mut self) -> Result<()> {
        outln!(self, "Encounter");
        outln!(self, ";{{");
        let index = self.byte()?;
        outln!(self, ";   Encounter#: ${index:02x}");
        outln!(self, ";}}");
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        outln!(self, "Wait");
        outln!(self, ";{{");
        let ticks = self.word()?;
        outln!(self, ";   Ticks = {ticks}");
        outln!(self, ";}}");
        Ok(())
    }

    /// The postfix conditional sub-language (`0xee ... 0xee <target>`).
    ///
    /// Value-producing tokens push, binary operators pop two and push one.
    /// While every term is a compile-time constant the expression is folded
    /// on [`SimulatedStack`]; the first token in `0x80..=0xf7` makes it
    /// dynamic, after which only the textual emission continues.
    fn conditional(&mut self, start: usize) -> Result<()> {
        let mut simulated = SimulatedStack::new();
        let mut dynamic = false;
        let mut depth: i32 = 0;

        outln!(self, "Conditional");
        outln!(self, "{{");

        loop {
            let token_offset = self.pos;
            let token = self.byte()?;
            if token == 0xee {
                break;
            }

            out!(self, ";   ");
            for _ in 0..depth {
                out!(self, ">");
            }

            if (0x80..=0xf7).contains(&token) {
                dynamic = true;
            }

            match token {
                0xf3 => self.count_monsters(&mut depth)?,
                0xda => {
                    outln!(self, "push(isPartyVisible())");
                    depth += 1;
                }
                0xdb => {
                    let rolls = self.byte()?;
                    let sides = self.byte()?;
                    let base = self.byte()?;
                    outln!(self, "push(rollDice({rolls}T{sides}+{base}))");
                    depth += 1;
                }
                0xdd => {
                    let race = self.byte()?;
                    outln!(self, "push(party.containsRace({race}))");
                    depth += 1;
                }
                0xce => {
                    let alignment = self.byte()?;
                    outln!(self, "push(party.containsAlignment({alignment}))");
                    depth += 1;
                }
                0xdc => {
                    let class = self.byte()?;
                    outln!(self, "push(party.containsClass({class}))");
                    depth += 1;
                }
                0xe0 => {
                    outln!(self, "push(trigger.flags)");
                    depth += 1;
                }
                0xed => {
                    outln!(self, "push(party.getDirection())");
                    depth += 1;
                }
                0xf0 => {
                    let flag = self.byte()?;
                    outln!(self, "push(getFlag(Global, {flag}))");
                    depth += 1;
                }
                0xe7 => self.pointer_item(&mut depth)?,
                0xe9 => {
                    let side = self.byte()?;
                    let (x, y) = self.position()?;
                    outln!(self, "push(maze.getWallSide({side}, [{x},{y}]))");
                    depth += 1;
                }
                0xf1 => {
                    let sub = self.byte()?;
                    if sub == 0xf5 {
                        let kind = self.word()?;
                        let flags = self.byte()?;
                        outln!(
                            self,
                            "push(party.inventory.count(type=0x{kind:04x}, flags=0x{flags:02x}))"
                        );
                    } else {
                        let high = self.byte()?;
                        let packed = (high as u16) << 8 | sub as u16;
                        outln!(
                            self,
                            "push(party.getPos()==[{},{}])",
                            packed & 31,
                            packed >> 5
                        );
                    }
                    depth += 1;
                }
                0xf5 => {
                    let item_kind = self.byte()?;
                    let (x, y) = self.position()?;
                    if item_kind == 0xff {
                        outln!(self, "push(maze.countItems([{x},{y}], item.type=ANY))");
                    } else {
                        outln!(
                            self,
                            "push(maze.countItems([{x},{y}], item.type=${item_kind:02x}))"
                        );
                    }
                    depth += 1;
                }
                0xf7 => {
                    let (x, y) = self.position()?;
                    outln!(self, "push(maze.getWallNumber([{x},{y}]))");
                    depth += 1;
                }
                0xef => {
                    let flag = self.byte()?;
                    outln!(self, "push(maze.getFlag({flag}))");
                    depth += 1;
                }
                0xff => self.binary_op(&mut simulated, dynamic, &mut depth, token_offset, "==", |a, b| a == b)?,
                0xfe => self.binary_op(&mut simulated, dynamic, &mut depth, token_offset, "!=", |a, b| a != b)?,
                0xfd => self.binary_op(&mut simulated, dynamic, &mut depth, token_offset, "<", |a, b| a < b)?,
                0xfc => self.binary_op(&mut simulated, dynamic, &mut depth, token_offset, "<=", |a, b| a <= b)?,
                0xfb => self.binary_op(&mut simulated, dynamic, &mut depth, token_offset, ">", |a, b| a > b)?,
                0xfa => self.binary_op(&mut simulated, dynamic, &mut depth, token_offset, ">=", |a, b| a >= b)?,
                0xf9 => self.binary_op(&mut simulated, dynamic, &mut depth, token_offset, "&&", |a, b| {
                    a != 0 && b != 0
                })?,
                0xf8 => self.binary_op(&mut simulated, dynamic, &mut depth, token_offset, "||", |a, b| {
                    a != 0 || b != 0
                })?,
                0x00 => {
                    if !dynamic {
                        simulated.push(0);
                    }
                    outln!(self, "push(false/0)");
                    depth += 1;
                }
                0x01 => {
                    if !dynamic {
                        simulated.push(1);
                    }
                    outln!(self, "push(true/1)");
                    depth += 1;
                }
                _ => {
                    if !dynamic {
                        simulated.push(token as i32);
                    }
                    outln!(self, "push(0x{token:02x})");
                    depth += 1;
                }
            }
        }

        let false_target = self.word()?;
        outln!(self, ";   if (!pop()) then jump 0x{false_target:04x}");
        outln!(self, ";}}");
        depth -= 1; // the branch itself consumes the result

        ensure!(
            depth == 0,
            StackImbalanceSnafu {
                offset: start,
                depth
            }
        );

        if !dynamic && simulated.len() == 1 {
            if simulated.pop() == 0 {
                outln!(self, "; Always false");
                outln!(
                    self,
                    ".assert _0x{false_target:04x} - * <= 255, error, \"Illegal branch\""
                );
                outln!(self, ".byte $f2, <(_0x{false_target:04x} - *)");
                self.branches.push(BranchRecord {
                    source: start as u16,
                    target: false_target,
                    kind: BranchKind::AlwaysFalse,
                });
            } else {
                outln!(self, "; Always true");
                self.branches.push(BranchRecord {
                    source: start as u16,
                    target: false_target,
                    kind: BranchKind::AlwaysTrue,
                });
            }
        } else {
            self.relocatable_record(start);
            ensure!(
                (false_target as usize) > start,
                IllegalBranchSnafu {
                    offset: start,
                    target: false_target
                }
            );
            outln!(
                self,
                ".assert _0x{false_target:04x} - * <= 255, error, \"Illegal branch\""
            );
            outln!(self, ".byte <(_0x{false_target:04x} - *)");
            outln!(self, "");
            self.branches.push(BranchRecord {
                source: start as u16,
                target: false_target,
                kind: BranchKind::Dynamic,
            });
        }
        Ok(())
    }

    /// Re-emits a dynamic conditional's raw bytes so the reassembler can
    /// relocate it. The short form replaces the opcode with the span length
    /// and drops the terminator; spans of 128 bytes or more keep both.
    fn relocatable_record(&mut self, start: usize) {
        let data = self.data;
        let terminator = self.pos - 3; // the 0xee closing the token stream
        if terminator - start < 128 {
            out!(self, ".byte ${:02x}", terminator - start);
            for &byte in &data[start + 1..terminator] {
                out!(self, ",${byte:02x}");
            }
        } else {
            out!(self, ".byte $ee");
            for &byte in &data[start + 1..=terminator] {
                out!(self, ",${byte:02x}");
            }
        }
        outln!(self, "");
    }

    /// A comparator or logical operator: pops two, pushes the result. While
    /// the expression is still static the pop order matters — the value on
    /// top of the stack is the left operand.
    fn binary_op(
        &mut self,
        simulated: &mut SimulatedStack,
        dynamic: bool,
        depth: &mut i32,
        offset: usize,
        symbol: &str,
        op: fn(i32, i32) -> bool,
    ) -> Result<()> {
        if !dynamic {
            ensure!(
                simulated.len() >= 2,
                StackImbalanceSnafu {
                    offset,
                    depth: *depth
                }
            );
            let a = simulated.pop();
            let b = simulated.pop();
            simulated.push(op(a, b) as i32);
        }
        outln!(self, "push(pop(){symbol}pop())");
        *depth -= 1;
        Ok(())
    }

    /// `0xf3`: either a positional monster count, or a chain of
    /// count/comparator pairs, one per monster type, closed by a zero byte.
    fn count_monsters(&mut self, depth: &mut i32) -> Result<()> {
        let mut sub = self.byte()?;
        if sub == 0xff {
            let (x, y) = self.position()?;
            outln!(self, "push(countMonstersAt([{x},{y}]))");
            *depth += 1;
        } else {
            loop {
                out!(self, "push(countMonstersOfType({sub})); ");
                let comparator = self.byte()?;
                out!(self, "push(0x{comparator:02x})");
                *depth += 2;

                sub = self.byte()?;
                if sub == 0 {
                    break;
                }
                out!(self, "; ");
            }
            outln!(self, "");
        }
        Ok(())
    }

    /// `0xe7`: predicates over the item held by the mouse pointer.
    fn pointer_item(&mut self, depth: &mut i32) -> Result<()> {
        let sub_offset = self.pos;
        let sub = self.byte()?;
        match sub {
            0xe1 => outln!(self, "push(party.pointerItem.type)"),
            0xf5 => outln!(self, "push(party.pointerItem)"),
            0xf6 => outln!(self, "push(party.pointerItem.value)"),
            0xd0 => {
                let name = self.byte()?;
                outln!(self, "push(party.pointerItem.unidentifiedName=={name})");
            }
            0xcf => {
                let name = self.byte()?;
                outln!(self, "push(party.pointerItem.identifiedName=={name})");
            }
            _ => {
                return UnknownOpcodeSnafu {
                    opcode: sub,
                    offset: sub_offset,
                }
                .fail();
            }
        }
        *depth += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use similar_asserts::assert_eq;

    use super::{mnemonic, BranchKind, BranchRecord, Decompilation, Decompiler, RESUME_SKIP};
    use crate::format::inf::triggers::TriggerTable;
    use crate::format::{FormatError, Result};

    /// Runs the decompiler over `script` with an empty trigger table placed
    /// right behind it.
    fn decompile(script: &[u8]) -> Result<Decompilation> {
        let mut data = script.to_vec();
        let trigger_offset = data.len() as u16;
        data.extend_from_slice(&0u16.to_le_bytes());

        let mut cur = Cursor::new(data.as_slice());
        let triggers = TriggerTable::load(&mut cur, trigger_offset).unwrap();
        Decompiler::new(&data, 0, trigger_offset, &triggers).run()
    }

    #[test]
    fn static_conditional_folds_to_always_true() {
        let result = decompile(&[0xee, 0x01, 0x01, 0xff, 0xee, 0x20, 0x00]).unwrap();
        assert!(result.text.contains("; Always true"));
        assert_eq!(
            result.branches,
            vec![BranchRecord {
                source: 0,
                target: 0x20,
                kind: BranchKind::AlwaysTrue
            }]
        );
    }

    #[test]
    fn static_conditional_folds_to_always_false() {
        let result = decompile(&[0xee, 0x01, 0x00, 0xff, 0xee, 0x20, 0x00]).unwrap();
        assert!(result.text.contains("; Always false"));
        assert!(result.text.contains(".byte $f2, <(_0x0020 - *)"));
        assert_eq!(result.branches[0].kind, BranchKind::AlwaysFalse);
    }

    #[test]
    fn dynamic_conditional_emits_relocatable_record() {
        let result = decompile(&[0xee, 0x01, 0xe0, 0xf9, 0xee, 0x10, 0x00]).unwrap();
        let expected = "\
_0x0000: ;Conditional
{
;   push(true/1)
;   >push(trigger.flags)
;   >>push(pop()&&pop())
;   if (!pop()) then jump 0x0010
;}
.byte $04,$01,$e0,$f9
.assert _0x0010 - * <= 255, error, \"Illegal branch\"
.byte <(_0x0010 - *)

";
        assert_eq!(result.text, expected);
        assert_eq!(
            result.branches,
            vec![BranchRecord {
                source: 0,
                target: 0x10,
                kind: BranchKind::Dynamic
            }]
        );
    }

    #[test]
    fn unbalanced_conditional_is_rejected() {
        let err = decompile(&[0xee, 0x01, 0x01, 0xee, 0x10, 0x00]).unwrap_err();
        assert_eq!(err, FormatError::StackImbalance { offset: 0, depth: 1 });
    }

    #[test]
    fn comparator_underflow_is_an_imbalance_not_a_panic() {
        let err = decompile(&[0xee, 0xff, 0xee, 0x10, 0x00]).unwrap_err();
        assert_eq!(err, FormatError::StackImbalance { offset: 1, depth: 0 });
    }

    #[test]
    fn dynamic_conditional_with_backward_target_is_illegal() {
        // a leading instruction moves the conditional off offset zero
        let err = decompile(&[0xf1, 0xee, 0xe0, 0xee, 0x01, 0x00]).unwrap_err();
        assert_eq!(
            err,
            FormatError::IllegalBranch {
                offset: 1,
                target: 1
            }
        );
    }

    #[test]
    fn backward_jump_is_illegal() {
        let err = decompile(&[0xf1, 0xf2, 0x00, 0x00]).unwrap_err();
        assert_eq!(
            err,
            FormatError::IllegalBranch {
                offset: 1,
                target: 0
            }
        );
    }

    #[test]
    fn forward_jump_is_recorded() {
        let result = decompile(&[0xf2, 0x05, 0x00, 0xf1, 0xf1, 0xf1]).unwrap();
        assert!(result.text.contains("jump 0x0005"));
        assert_eq!(
            result.branches,
            vec![BranchRecord {
                source: 0,
                target: 5,
                kind: BranchKind::AlwaysTrue
            }]
        );
    }

    #[test]
    fn unknown_opcode_reports_offset_and_skip_window() {
        let err = decompile(&[0xf1, 0xd0]).unwrap_err();
        assert_eq!(
            err,
            FormatError::UnknownOpcode {
                opcode: 0xd0,
                offset: 1
            }
        );
        assert_eq!(RESUME_SKIP, 16);
    }

    #[test]
    fn message_reads_string_color_and_pad() {
        let result = decompile(&[0xf8, b'H', b'I', 0x00, 0x05, 0x00]).unwrap();
        assert!(result.text.contains("Message: HI Color: 5"));
    }

    #[test]
    fn set_wall_block_layout() {
        let result = decompile(&[0xff, 0xf7, 0x43, 0x00, 0x07]).unwrap();
        let expected = "\
_0x0000: ;SetWall
;{
;   Type = Change all sides
;   Position = [3,2]
;   Change to = 7
;}
";
        assert_eq!(result.text, expected);
    }

    #[test]
    fn trigger_cross_reference_precedes_instruction() {
        let mut data = vec![0xf1]; // script: one Abort event at offset 0
        let trigger_offset = data.len() as u16;
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&((2u16 << 5) | 3).to_le_bytes()); // [3,2]
        data.push(0x18);
        data.extend_from_slice(&0u16.to_le_bytes()); // handler at offset 0

        let mut cur = Cursor::new(data.as_slice());
        let triggers = TriggerTable::load(&mut cur, trigger_offset).unwrap();
        let result = Decompiler::new(&data, 0, trigger_offset, &triggers)
            .run()
            .unwrap();

        let banner = "; Referenced by trigger $00. Pos:[3,2] Flags: \
                      false false false true true false false false ";
        let banner_at = result.text.find(banner).unwrap();
        let instruction_at = result.text.find("_0x0000: ;Abort event").unwrap();
        assert!(banner_at < instruction_at);
    }

    #[test]
    fn change_level_hole_through_trigger_square() {
        // real level change one level down, direction 255, on the trigger square
        let mut data = vec![0xec, 0xe5, 0x01, 0x43, 0x00, 0xff];
        let trigger_offset = data.len() as u16;
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&((2u16 << 5) | 3).to_le_bytes()); // [3,2]
        data.push(0x00);
        data.extend_from_slice(&0u16.to_le_bytes());

        let mut cur = Cursor::new(data.as_slice());
        let triggers = TriggerTable::load(&mut cur, trigger_offset).unwrap();
        let result = Decompiler::new(&data, 0, trigger_offset, &triggers)
            .run()
            .unwrap();
        assert!(result.text.contains(".byte $e4"));
    }

    #[test]
    fn monster_count_chain_stays_dynamic() {
        // two count/comparator pairs, four values total, folded by three
        // comparisons down to one
        let script = [
            0xee, 0xf3, 0x02, 0xfb, 0x03, 0xfc, 0x00, 0xfa, 0xff, 0xf9, 0xee, 0x40, 0x00,
        ];
        let result = decompile(&script).unwrap();
        assert!(result.text.contains(
            "push(countMonstersOfType(2)); push(0xfb); push(countMonstersOfType(3)); push(0xfc)"
        ));
        assert_eq!(result.branches[0].kind, super::BranchKind::Dynamic);
    }

    #[test]
    fn opcode_table_is_complete() {
        assert_eq!(mnemonic(0xff), Some("SetWall"));
        assert_eq!(mnemonic(0xe2), Some("SpecialWindowPictures"));
        assert_eq!(mnemonic(0xe1), None);
        let known = (0u16..=255).filter(|&op| mnemonic(op as u8).is_some()).count();
        assert_eq!(known, 30);
    }
}
