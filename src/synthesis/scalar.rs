//! Fixed-width scalar values produced by packet functions

use std::fmt;

/// Bit width of a scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    pub fn bits(&self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
        }
    }

    pub fn bytes(&self) -> usize {
        (self.bits() / 8) as usize
    }
}

/// A value of one of the three unsigned widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    U8(u8),
    U16(u16),
    U32(u32),
}

impl Scalar {
    pub fn width(&self) -> Width {
        match self {
            Scalar::U8(_) => Width::W8,
            Scalar::U16(_) => Width::W16,
            Scalar::U32(_) => Width::W32,
        }
    }

    /// Value widened to `u32`; this is the value a sign compares against
    pub fn lift(&self) -> u32 {
        match *self {
            Scalar::U8(v) => v as u32,
            Scalar::U16(v) => v as u32,
            Scalar::U32(v) => v,
        }
    }

    /// Zero-extend to `width`. Never narrows
    pub fn promote(self, width: Width) -> Scalar {
        if width <= self.width() {
            return self;
        }
        match width {
            Width::W16 => Scalar::U16(self.lift() as u16),
            _ => Scalar::U32(self.lift()),
        }
    }

    /// Promote both operands to the wider of the two widths
    pub fn promote_pair(a: Scalar, b: Scalar) -> (Scalar, Scalar) {
        let width = a.width().max(b.width());
        (a.promote(width), b.promote(width))
    }

    /// Apply a bitwise operation lane-wise after promotion
    pub fn zip_with(a: Scalar, b: Scalar, op: impl Fn(u32, u32) -> u32) -> Scalar {
        match Scalar::promote_pair(a, b) {
            (Scalar::U8(x), Scalar::U8(y)) => Scalar::U8(op(x as u32, y as u32) as u8),
            (Scalar::U16(x), Scalar::U16(y)) => Scalar::U16(op(x as u32, y as u32) as u16),
            (x, y) => Scalar::U32(op(x.lift(), y.lift())),
        }
    }

    /// Shift left within the current width. Shifting by the width or more yields 0
    pub fn shl(self, n: u32) -> Scalar {
        match self {
            Scalar::U8(v) => Scalar::U8(v.checked_shl(n).unwrap_or(0)),
            Scalar::U16(v) => Scalar::U16(v.checked_shl(n).unwrap_or(0)),
            Scalar::U32(v) => Scalar::U32(v.checked_shl(n).unwrap_or(0)),
        }
    }

    /// Shift right within the current width. Shifting by the width or more yields 0
    pub fn shr(self, n: u32) -> Scalar {
        match self {
            Scalar::U8(v) => Scalar::U8(v.checked_shr(n).unwrap_or(0)),
            Scalar::U16(v) => Scalar::U16(v.checked_shr(n).unwrap_or(0)),
            Scalar::U32(v) => Scalar::U32(v.checked_shr(n).unwrap_or(0)),
        }
    }

    /// Big-endian bytes of the value, `width().bytes()` long
    pub fn to_be_bytes(&self) -> Vec<u8> {
        match *self {
            Scalar::U8(v) => vec![v],
            Scalar::U16(v) => v.to_be_bytes().to_vec(),
            Scalar::U32(v) => v.to_be_bytes().to_vec(),
        }
    }

    /// Rebuild a scalar from big-endian bytes. A 3-byte slice is read as a `U32`
    pub fn from_be_bytes(bytes: &[u8]) -> Scalar {
        match bytes.len() {
            0 => Scalar::U8(0),
            1 => Scalar::U8(bytes[0]),
            2 => Scalar::U16(u16::from_be_bytes([bytes[0], bytes[1]])),
            _ => {
                let mut buf = [0u8; 4];
                let take = bytes.len().min(4);
                buf[4 - take..].copy_from_slice(&bytes[bytes.len() - take..]);
                Scalar::U32(u32::from_be_bytes(buf))
            }
        }
    }

    /// Keep the first `n` big-endian bytes, clamped to the value's length
    pub fn left_bytes(self, n: usize) -> Scalar {
        let bytes = self.to_be_bytes();
        let keep = bytes.len().min(n);
        Scalar::from_be_bytes(&bytes[..keep])
    }

    /// Keep the last `n` big-endian bytes, clamped to the value's length
    pub fn right_bytes(self, n: usize) -> Scalar {
        let bytes = self.to_be_bytes();
        let keep = bytes.len().min(n);
        Scalar::from_be_bytes(&bytes[bytes.len() - keep..])
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lift())
    }
}
