#![forbid(unsafe_code)]
//! Per-mapping hint blobs.
//!
//! A hint is an opaque blob of a configured width persisted next to each
//! cache mapping. The width need not be a power of two, so the blob is cut
//! greedily into fields: as many 8-byte fields as fit, then at most one
//! 4-byte, one 2-byte and one 1-byte field. Fields are laid out in that
//! order and each one is little-endian.
//!
//! The codec writes a deterministic value into every field and can check a
//! blob read back from storage against it, which is how the policy proves
//! that hints survive a metadata commit and reload unchanged.
//!
//! ```text
//! width = 23:  | u64 | u64 | u32 | u16 | u8 |
//!               0     8     16    20    22
//! ```

use dmc_error::{PolicyError, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Largest hint width a policy accepts.
pub const MAX_HINT_WIDTH: usize = 2048;

/// Field widths in layout order, widest first.
pub const FIELD_WIDTHS: [usize; 4] = [8, 4, 2, 1];

/// Number of fields of one width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldClass {
    pub width: usize,
    pub count: usize,
}

/// One field's position within the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintField {
    /// Width class index, 0 for 8-byte fields through 3 for 1-byte fields.
    pub row: usize,
    /// Index within the width class.
    pub field: usize,
    pub width: usize,
    pub offset: usize,
}

impl HintField {
    /// Value the encoder stores in this field.
    #[must_use]
    pub fn expected_value(&self) -> u64 {
        (self.field as u64 + 1) * (self.row as u64 + 1)
    }
}

/// A field that did not decode to its expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "{width}-byte field {field} at offset {offset}: expected {expected:#x}, got {actual:#x}"
)]
pub struct HintMismatch {
    pub width: usize,
    pub field: usize,
    pub offset: usize,
    pub expected: u64,
    pub actual: u64,
}

impl From<HintMismatch> for PolicyError {
    fn from(m: HintMismatch) -> Self {
        Self::Mismatch {
            width: m.width,
            field: m.field,
            offset: m.offset,
            expected: m.expected,
            actual: m.actual,
        }
    }
}

/// `(width, count)` table for a configured hint width, computed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintLayout {
    width: usize,
    classes: [FieldClass; 4],
}

impl HintLayout {
    /// Greedy widest-first decomposition of `width` bytes.
    pub fn new(width: usize) -> Result<Self> {
        if width == 0 || width > MAX_HINT_WIDTH {
            return Err(PolicyError::InvalidArgument(format!(
                "hint width {width} outside 1..={MAX_HINT_WIDTH}"
            )));
        }

        let mut remaining = width;
        let classes = FIELD_WIDTHS.map(|field_width| {
            let count = remaining / field_width;
            remaining -= count * field_width;
            FieldClass {
                width: field_width,
                count,
            }
        });
        debug_assert_eq!(remaining, 0);

        debug!(
            target: "dmc::hint",
            event = "layout",
            width,
            u64_fields = classes[0].count,
            u32_fields = classes[1].count,
            u16_fields = classes[2].count,
            u8_fields = classes[3].count
        );
        Ok(Self { width, classes })
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn classes(&self) -> &[FieldClass; 4] {
        &self.classes
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.classes.iter().map(|class| class.count).sum()
    }

    /// Every field in layout order.
    pub fn fields(&self) -> impl Iterator<Item = HintField> + '_ {
        let mut offset = 0;
        self.classes
            .iter()
            .enumerate()
            .flat_map(|(row, class)| (0..class.count).map(move |field| (row, field, class.width)))
            .map(move |(row, field, width)| {
                let f = HintField {
                    row,
                    field,
                    width,
                    offset,
                };
                offset += width;
                f
            })
    }

    fn check_len(&self, buf: &[u8]) -> Result<()> {
        if buf.len() == self.width {
            Ok(())
        } else {
            Err(PolicyError::InvalidArgument(format!(
                "hint buffer is {} bytes, layout needs {}",
                buf.len(),
                self.width
            )))
        }
    }

    /// Write every field's expected value into `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf)?;
        for field in self.fields() {
            let slot = &mut buf[field.offset..field.offset + field.width];
            write_le(slot, field.expected_value())?;
        }
        Ok(())
    }

    /// Every field of `buf` that differs from what [`encode`](Self::encode) writes.
    pub fn mismatches(&self, buf: &[u8]) -> Result<Vec<HintMismatch>> {
        self.check_len(buf)?;
        Ok(self
            .fields()
            .filter_map(|field| {
                let expected = field.expected_value();
                let actual = read_le(&buf[field.offset..field.offset + field.width]);
                (actual != expected).then_some(HintMismatch {
                    width: field.width,
                    field: field.field,
                    offset: field.offset,
                    expected,
                    actual,
                })
            })
            .collect())
    }

    /// Check `buf` field by field, failing on the first mismatch.
    pub fn decode_and_verify(&self, buf: &[u8]) -> Result<()> {
        match self.mismatches(buf)?.first() {
            Some(mismatch) => Err((*mismatch).into()),
            None => Ok(()),
        }
    }
}

/// Little-endian store of `value` narrowed to `slot.len()` bytes.
fn write_le(slot: &mut [u8], value: u64) -> Result<()> {
    let len = slot.len();
    let overflow = || {
        PolicyError::InvalidArgument(format!(
            "hint value {value:#x} overflows a {len}-byte field"
        ))
    };
    match len {
        8 => slot.copy_from_slice(&value.to_le_bytes()),
        4 => slot.copy_from_slice(&u32::try_from(value).map_err(|_| overflow())?.to_le_bytes()),
        2 => slot.copy_from_slice(&u16::try_from(value).map_err(|_| overflow())?.to_le_bytes()),
        1 => slot[0] = u8::try_from(value).map_err(|_| overflow())?,
        other => {
            return Err(PolicyError::InvalidArgument(format!(
                "unsupported hint field width {other}"
            )));
        }
    }
    Ok(())
}

fn read_le(slot: &[u8]) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes[..slot.len()].copy_from_slice(slot);
    u64::from_le_bytes(bytes)
}

/// Layout plus the scratch buffer hints are staged in.
///
/// Each policy owns one, so concurrently open policies never share a buffer.
#[derive(Debug, Clone)]
pub struct HintCodec {
    layout: HintLayout,
    scratch: Vec<u8>,
}

impl HintCodec {
    #[must_use]
    pub fn new(layout: HintLayout) -> Self {
        Self {
            scratch: vec![0_u8; layout.width()],
            layout,
        }
    }

    #[must_use]
    pub fn layout(&self) -> &HintLayout {
        &self.layout
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.layout.width()
    }

    /// Encode into the scratch buffer and borrow the result.
    pub fn encode(&mut self) -> Result<&[u8]> {
        self.layout.encode(&mut self.scratch)?;
        Ok(&self.scratch)
    }

    pub fn decode_and_verify(&self, buf: &[u8]) -> Result<()> {
        self.layout.decode_and_verify(buf)
    }
}
