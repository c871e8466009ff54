//! Packet functions as expression trees
//!
//! A [`PacketFunction`] is evaluated by walking its tree and rendered for
//! reports by printing the same tree, so evaluation and composition can never
//! drift apart.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::scalar::Scalar;
use crate::packet::{Field, Packet};

/// Operators combining two packet functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    Xor,
    And,
    Or,
}

impl BinaryOp {
    pub fn apply(&self, a: Scalar, b: Scalar) -> Scalar {
        match self {
            BinaryOp::Xor => Scalar::zip_with(a, b, |x, y| x ^ y),
            BinaryOp::And => Scalar::zip_with(a, b, |x, y| x & y),
            BinaryOp::Or => Scalar::zip_with(a, b, |x, y| x | y),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinaryOp::Xor => "xor",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        };
        f.write_str(name)
    }
}

impl FromStr for BinaryOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "xor" => Ok(BinaryOp::Xor),
            "and" => Ok(BinaryOp::And),
            "or" => Ok(BinaryOp::Or),
            other => Err(format!("Unknown binary operation: {}", other)),
        }
    }
}

/// Feature extractions applied to a single packet function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    #[serde(rename = "lbytes")]
    LeftBytes(u8),
    #[serde(rename = "rbytes")]
    RightBytes(u8),
    #[serde(rename = "lbitshift")]
    ShiftLeft(u8),
    #[serde(rename = "rbitshift")]
    ShiftRight(u8),
}

impl UnaryOp {
    pub fn apply(&self, x: Scalar) -> Scalar {
        match *self {
            UnaryOp::LeftBytes(n) => x.left_bytes(n as usize),
            UnaryOp::RightBytes(n) => x.right_bytes(n as usize),
            UnaryOp::ShiftLeft(n) => x.shl(n as u32),
            UnaryOp::ShiftRight(n) => x.shr(n as u32),
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::LeftBytes(n) => write!(f, "lbytes: {}", n),
            UnaryOp::RightBytes(n) => write!(f, "rbytes: {}", n),
            UnaryOp::ShiftLeft(n) => write!(f, "lbitshift: {}", n),
            UnaryOp::ShiftRight(n) => write!(f, "rbitshift: {}", n),
        }
    }
}

impl FromStr for UnaryOp {
    type Err = String;

    /// Parses the rendered form, e.g. `lbytes:2` or `rbitshift: 4`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = s
            .split_once(':')
            .ok_or_else(|| format!("Expected <op>:<n>, got {}", s))?;
        let n: u8 = arg
            .trim()
            .parse()
            .map_err(|e| format!("Invalid operand in {}: {}", s, e))?;
        match name.trim().to_lowercase().as_str() {
            "lbytes" => Ok(UnaryOp::LeftBytes(n)),
            "rbytes" => Ok(UnaryOp::RightBytes(n)),
            "lbitshift" => Ok(UnaryOp::ShiftLeft(n)),
            "rbitshift" => Ok(UnaryOp::ShiftRight(n)),
            other => Err(format!("Unknown feature extraction: {}", other)),
        }
    }
}

/// Expression tree of a packet function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Field(Field),
    Unary(UnaryOp, Arc<Expr>),
    Binary(BinaryOp, Arc<Expr>, Arc<Expr>),
}

impl Expr {
    pub fn eval(&self, packet: &Packet) -> Scalar {
        match self {
            Expr::Field(field) => extract(*field, packet),
            Expr::Unary(op, child) => op.apply(child.eval(packet)),
            Expr::Binary(op, left, right) => op.apply(left.eval(packet), right.eval(packet)),
        }
    }

    /// Node label used in compositions
    pub fn label(&self) -> String {
        match self {
            Expr::Field(field) => field.label().to_string(),
            Expr::Unary(op, _) => op.to_string(),
            Expr::Binary(op, _, _) => op.to_string(),
        }
    }

    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Field(_) => Vec::new(),
            Expr::Unary(_, child) => vec![child.as_ref()],
            Expr::Binary(_, left, right) => vec![left.as_ref(), right.as_ref()],
        }
    }
}

/// Read a header field as a scalar of the field's natural width
pub fn extract(field: Field, packet: &Packet) -> Scalar {
    match field {
        Field::IpId => Scalar::U16(packet.ip_id),
        Field::SrcIp => Scalar::U32(packet.src_ip),
        Field::DstIp => Scalar::U32(packet.dst_ip),
        Field::SrcPort => Scalar::U16(packet.src_port),
        Field::DstPort => Scalar::U16(packet.dst_port),
        Field::Seq => Scalar::U32(packet.seq),
        Field::Window => Scalar::U16(packet.window),
    }
}

/// A candidate function over packets together with its operator cost
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketFunction {
    expr: Arc<Expr>,
    cost: u32,
}

impl PacketFunction {
    /// Seed extractor for one field, cost 1
    pub fn seed(field: Field) -> Self {
        Self {
            expr: Arc::new(Expr::Field(field)),
            cost: 1,
        }
    }

    /// Apply a feature extraction; cost grows by one
    pub fn unary(op: UnaryOp, f: &PacketFunction) -> Self {
        Self {
            expr: Arc::new(Expr::Unary(op, f.expr.clone())),
            cost: f.cost + 1,
        }
    }

    /// Combine two functions; cost is one plus both operand costs
    pub fn binary(op: BinaryOp, a: &PacketFunction, b: &PacketFunction) -> Self {
        Self {
            expr: Arc::new(Expr::Binary(op, a.expr.clone(), b.expr.clone())),
            cost: 1 + a.cost + b.cost,
        }
    }

    pub fn eval(&self, packet: &Packet) -> Scalar {
        self.expr.eval(packet)
    }

    /// Evaluate and lift to the value signs are compared against
    pub fn apply(&self, packet: &Packet) -> u32 {
        self.expr.eval(packet).lift()
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Human readable composition tree
    pub fn composition(&self) -> Composition<'_> {
        Composition { expr: &self.expr }
    }
}

/// Seed extractors for every packet field
pub fn initial_set() -> Vec<PacketFunction> {
    Field::ALL.iter().map(|f| PacketFunction::seed(*f)).collect()
}

/// Indented rendering of an expression tree, two spaces per level
#[derive(Debug, Clone, Copy)]
pub struct Composition<'a> {
    expr: &'a Expr,
}

impl fmt::Display for Composition<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_node(f, self.expr, 0)
    }
}

fn write_node(f: &mut fmt::Formatter<'_>, expr: &Expr, depth: usize) -> fmt::Result {
    let indent = "  ".repeat(depth);
    let children = expr.children();
    if children.is_empty() {
        return write!(f, "{}{}", indent, expr.label());
    }
    write!(f, "{}{}:", indent, expr.label())?;
    for child in children {
        writeln!(f)?;
        write_node(f, child, depth + 1)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet() -> Packet {
        Packet {
            ip_id: 0x0102,
            src_ip: 0x0a00_0001,
            dst_ip: 0xc0a8_0101,
            src_port: 40000,
            dst_port: 443,
            seq: 0x1122_3344,
            window: 1024,
        }
    }

    #[test]
    fn test_seed_extractors() {
        let p = packet();
        let values: Vec<u32> = initial_set().iter().map(|f| f.apply(&p)).collect();
        assert_eq!(
            values,
            vec![0x0102, 0x0a00_0001, 0xc0a8_0101, 40000, 443, 0x1122_3344, 1024]
        );
        assert!(initial_set().iter().all(|f| f.cost() == 1));
    }

    #[test]
    fn test_composed_evaluation_and_cost() {
        let seq = PacketFunction::seed(Field::Seq);
        let l2b = PacketFunction::unary(UnaryOp::LeftBytes(2), &seq);
        let xored = PacketFunction::binary(BinaryOp::Xor, &l2b, &seq);

        assert_eq!(l2b.eval(&packet()), Scalar::U16(0x1122));
        assert_eq!(xored.eval(&packet()), Scalar::U32(0x1122_3344 ^ 0x1122));
        assert_eq!(l2b.cost(), 2);
        assert_eq!(xored.cost(), 4);
    }

    #[test]
    fn test_ip_id_xor_low_seq_byte() {
        let r1 = PacketFunction::unary(UnaryOp::RightBytes(1), &PacketFunction::seed(Field::Seq));
        let f = PacketFunction::binary(BinaryOp::Xor, &r1, &PacketFunction::seed(Field::IpId));
        assert_eq!(f.eval(&packet()), Scalar::U16(0x44 ^ 0x0102));
    }

    #[test]
    fn test_composition_rendering() {
        let seq = PacketFunction::seed(Field::Seq);
        let f = PacketFunction::binary(
            BinaryOp::Xor,
            &PacketFunction::unary(UnaryOp::LeftBytes(2), &seq),
            &PacketFunction::seed(Field::DstIp),
        );
        assert_eq!(
            f.composition().to_string(),
            "xor:\n  lbytes: 2:\n    Get Seq\n  Get Dst IP"
        );
        assert_eq!(seq.composition().to_string(), "Get Seq");
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("XOR".parse::<BinaryOp>(), Ok(BinaryOp::Xor));
        assert!("nand".parse::<BinaryOp>().is_err());
        assert_eq!("lbytes:2".parse::<UnaryOp>(), Ok(UnaryOp::LeftBytes(2)));
        assert_eq!("rbitshift: 4".parse::<UnaryOp>(), Ok(UnaryOp::ShiftRight(4)));
        assert!("rbytes".parse::<UnaryOp>().is_err());
        assert_eq!(UnaryOp::RightBytes(1).to_string(), "rbytes: 1");
    }
}
