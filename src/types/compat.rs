//! Type compatibility, implicit conversions and arithmetic promotion

use super::{Type, TypeId, TypeTable};

/// Arithmetic rank, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rank {
    /// `int` (8-bit types promote here)
    Int,
    /// `unsigned int`
    UInt,
    /// `long`
    Long,
    /// `unsigned long`
    ULong,
    /// `float`
    Float,
    /// `double`
    Double,
}

impl Rank {
    /// The type of this rank
    pub fn type_id(self) -> TypeId {
        match self {
            Rank::Int => TypeId::INT,
            Rank::UInt => TypeId::UINT,
            Rank::Long => TypeId::LONG,
            Rank::ULong => TypeId::ULONG,
            Rank::Float => TypeId::FLOAT,
            Rank::Double => TypeId::DOUBLE,
        }
    }
}

/// How a value of one type becomes a value of another
#[derive(Debug, Clone, PartialEq)]
pub enum Conversion {
    /// Same type; nothing to do
    Identity,
    /// Numeric conversion (width, signedness or int/float)
    Numeric,
    /// Same bits, different type (pointer to pointer, null constant)
    Reinterpret,
    /// Derived pointer to base pointer: add the base offset, keep null
    BaseAdjust(i32),
    /// Not allowed; the message explains why
    Invalid(String),
}

/// A compile-time constant offered for conversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstHint {
    /// Integer constant
    Int(i64),
    /// Floating constant
    Float(f64),
}

impl TypeTable {
    /// Arithmetic rank of a type, after promotion
    pub fn rank(&self, ty: TypeId) -> Option<Rank> {
        match self.kind(ty) {
            Type::Int { bits: 32, signed } => Some(if *signed { Rank::Long } else { Rank::ULong }),
            Type::Int { bits: 16, signed } => Some(if *signed { Rank::Int } else { Rank::UInt }),
            Type::Int { .. } => Some(Rank::Int),
            Type::Float { bits: 32 } => Some(Rank::Float),
            Type::Float { .. } => Some(Rank::Double),
            _ => None,
        }
    }

    /// Integer promotion: 8-bit types become `int`, qualifiers are dropped
    pub fn promote(&self, ty: TypeId) -> TypeId {
        match self.rank(ty) {
            Some(r) => r.type_id(),
            None => self.unqualified(ty),
        }
    }

    /// The stronger of two arithmetic types
    pub fn common_type(&self, a: TypeId, b: TypeId) -> TypeId {
        match (self.rank(a), self.rank(b)) {
            (Some(ra), Some(rb)) => ra.max(rb).type_id(),
            _ => self.unqualified(a),
        }
    }

    /// Bit width and signedness of an integer type
    pub fn int_info(&self, ty: TypeId) -> Option<(u8, bool)> {
        match self.kind(ty) {
            Type::Int { bits, signed } => Some((*bits, *signed)),
            Type::Pointer(_) => Some((16, false)),
            _ => None,
        }
    }

    /// Whether an integer value is representable in `ty` (either signedness
    /// of its width)
    pub fn int_fits(&self, ty: TypeId, value: i64) -> bool {
        match self.int_info(ty) {
            Some((bits, _)) => {
                let min = -(1i64 << (bits - 1));
                let max = (1i64 << bits) - 1;
                (min..=max).contains(&value)
            }
            None => false,
        }
    }

    /// Conversion applied on assignment, initialization, argument passing
    /// and return
    pub fn assign_conversion(
        &self,
        from: TypeId,
        to: TypeId,
        constant: Option<ConstHint>,
    ) -> Conversion {
        let from_u = self.unqualified(from);
        let to_u = self.unqualified(to);
        if from_u == to_u {
            return Conversion::Identity;
        }

        match (self.get(from_u), self.get(to_u)) {
            (_, Type::Pointer(_)) if constant == Some(ConstHint::Int(0)) && self.is_integer(from_u) => {
                Conversion::Reinterpret
            }
            (Type::Pointer(fp), Type::Pointer(tp)) => self.pointer_conversion(*fp, *tp),
            (Type::Int { .. }, Type::Int { .. }) => {
                let widening = self.size_of(to_u) >= self.size_of(from_u);
                let fits = matches!(constant, Some(ConstHint::Int(v)) if self.int_fits(to_u, v));
                if widening || fits {
                    Conversion::Numeric
                } else {
                    Conversion::Invalid(format!(
                        "conversion from '{}' to '{}' may lose data; use a cast",
                        self.display(from),
                        self.display(to)
                    ))
                }
            }
            (Type::Int { .. }, Type::Float { .. }) => Conversion::Numeric,
            (Type::Float { bits: fb }, Type::Float { bits: tb }) => {
                if tb >= fb || matches!(constant, Some(ConstHint::Float(_))) {
                    Conversion::Numeric
                } else {
                    Conversion::Invalid(format!(
                        "conversion from '{}' to '{}' may lose precision; use a cast",
                        self.display(from),
                        self.display(to)
                    ))
                }
            }
            (Type::Float { .. }, Type::Int { .. }) => match constant {
                Some(ConstHint::Float(v)) if v.fract() == 0.0 && self.int_fits(to_u, v as i64) => {
                    Conversion::Numeric
                }
                _ => Conversion::Invalid(format!(
                    "conversion from '{}' to '{}' requires a cast",
                    self.display(from),
                    self.display(to)
                )),
            },
            (Type::Pointer(_), Type::Int { .. }) | (Type::Int { .. }, Type::Pointer(_)) => {
                Conversion::Invalid(format!(
                    "incompatible types: '{}' to '{}' requires a cast",
                    self.display(from),
                    self.display(to)
                ))
            }
            _ => Conversion::Invalid(format!(
                "incompatible types: cannot convert '{}' to '{}'",
                self.display(from),
                self.display(to)
            )),
        }
    }

    fn pointer_conversion(&self, fp: TypeId, tp: TypeId) -> Conversion {
        let discards = (self.is_const(fp) && !self.is_const(tp))
            || (self.is_volatile(fp) && !self.is_volatile(tp));
        if discards {
            return Conversion::Invalid(format!(
                "conversion from '{}*' to '{}*' discards qualifiers",
                self.display(fp),
                self.display(tp)
            ));
        }
        let fpu = self.unqualified(fp);
        let tpu = self.unqualified(tp);
        if fpu == tpu {
            return Conversion::Reinterpret;
        }
        let void_either = matches!(self.get(fpu), Type::Void) || matches!(self.get(tpu), Type::Void);
        let function_either = self.is_function(fpu) || self.is_function(tpu);
        if void_either && !function_either {
            return Conversion::Reinterpret;
        }
        if let (Some(d), Some(b)) = (self.as_struct(fpu), self.as_struct(tpu)) {
            if let Some(off) = self.base_offset(d, b) {
                return if off == 0 {
                    Conversion::Reinterpret
                } else {
                    Conversion::BaseAdjust(off as i32)
                };
            }
        }
        Conversion::Invalid(format!(
            "incompatible pointer types: '{}*' to '{}*'",
            self.display(fp),
            self.display(tp)
        ))
    }

    /// Whether the outermost level is `volatile`
    pub fn is_volatile(&self, ty: TypeId) -> bool {
        matches!(self.get(ty), Type::Qualified { is_volatile: true, .. })
    }

    /// Conversion performed by an explicit cast
    pub fn cast_conversion(&self, from: TypeId, to: TypeId) -> Conversion {
        let from_u = self.unqualified(from);
        let to_u = self.unqualified(to);
        if from_u == to_u {
            return Conversion::Identity;
        }
        if self.is_void(to_u) {
            return Conversion::Numeric;
        }
        match (self.get(from_u), self.get(to_u)) {
            (Type::Pointer(fp), Type::Pointer(tp)) => {
                let (fs, ts) = (self.as_struct(*fp), self.as_struct(*tp));
                if let (Some(d), Some(b)) = (fs, ts) {
                    if let Some(off) = self.base_offset(d, b).filter(|o| *o != 0) {
                        return Conversion::BaseAdjust(off as i32);
                    }
                    if let Some(off) = self.base_offset(b, d).filter(|o| *o != 0) {
                        return Conversion::BaseAdjust(-(off as i32));
                    }
                }
                Conversion::Reinterpret
            }
            (Type::Float { .. }, Type::Pointer(_)) | (Type::Pointer(_), Type::Float { .. }) => {
                Conversion::Invalid(format!(
                    "invalid cast from '{}' to '{}'",
                    self.display(from),
                    self.display(to)
                ))
            }
            (Type::Pointer(_), Type::Int { .. }) | (Type::Int { .. }, Type::Pointer(_)) => {
                Conversion::Reinterpret
            }
            _ if self.is_arith(from_u) && self.is_arith(to_u) => Conversion::Numeric,
            _ => Conversion::Invalid(format!(
                "invalid cast from '{}' to '{}'",
                self.display(from),
                self.display(to)
            )),
        }
    }
}
