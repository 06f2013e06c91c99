//! Implement support for various formats used in the game.

pub mod compression;
pub mod cps;
pub mod inf;

use snafu::Snafu;

/// Errors produced while decoding game resources.
///
/// Decoding is single-shot and deterministic: the same input always produces
/// the same result, so none of these are worth retrying. Offsets are relative
/// to the buffer handed to the failing component.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FormatError {
    /// The envelope's declared stream length disagrees with the actual buffer
    /// length beyond the tolerated ambiguity.
    #[snafu(display(
        "declared stream length {declared} does not match buffer length {actual}"
    ))]
    StructuralMismatch { declared: usize, actual: usize },

    /// The declared payload length is zero.
    #[snafu(display("declared payload length is zero (offset {offset})"))]
    EmptyStream { offset: usize },

    /// A computed length or offset escapes the size caps or the remaining
    /// buffer.
    #[snafu(display("output overflow at offset {offset}"))]
    Overflow { offset: usize },

    /// The envelope carries a compression tag we have no decoder for.
    #[snafu(display("unknown compression type {tag}"))]
    UnknownCompression { tag: u16 },

    /// A byte with no decoding rule was encountered at the top level of a
    /// script stream.
    #[snafu(display("unknown opcode 0x{opcode:02x} at offset 0x{offset:04x}"))]
    UnknownOpcode { opcode: u8, offset: usize },

    /// A jump or conditional targets an address the downstream encoding
    /// cannot represent (backward, or behind the instruction itself).
    #[snafu(display("illegal branch to 0x{target:04x} at offset 0x{offset:04x}"))]
    IllegalBranch { offset: usize, target: u16 },

    /// A conditional expression is unbalanced: it would not leave exactly one
    /// value on the evaluation stack.
    #[snafu(display(
        "unbalanced conditional expression at offset 0x{offset:04x} (stack depth {depth})"
    ))]
    StackImbalance { offset: usize, depth: i32 },
}

pub type Result<T, E = FormatError> = std::result::Result<T, E>;
