//! Method descriptor parsing and per-type JVM facts (slot widths, typed
//! load/return opcodes, boxing targets).

use crate::error::ClassFileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    /// Internal name, e.g. `java/lang/String`.
    Object(String),
    /// Element type plus dimension count.
    Array(Box<FieldType>, u8),
}

impl FieldType {
    /// Local variable slots this type occupies (long and double take two).
    pub fn slot_width(&self) -> u16 {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    /// The typed `Tload` opcode for reading this value out of a local slot.
    pub fn load_opcode(&self) -> u8 {
        match self {
            FieldType::Long => 0x16,                         // lload
            FieldType::Float => 0x17,                        // fload
            FieldType::Double => 0x18,                       // dload
            FieldType::Object(_) | FieldType::Array(..) => 0x19, // aload
            _ => 0x15,                                       // iload
        }
    }

    /// The typed `Tstore` opcode for writing this value into a local slot.
    pub fn store_opcode(&self) -> u8 {
        match self {
            FieldType::Long => 0x37,                         // lstore
            FieldType::Float => 0x38,                        // fstore
            FieldType::Double => 0x39,                       // dstore
            FieldType::Object(_) | FieldType::Array(..) => 0x3a, // astore
            _ => 0x36,                                       // istore
        }
    }

    /// The typed `Treturn` opcode.
    pub fn return_opcode(&self) -> u8 {
        match self {
            FieldType::Long => 0xad,                         // lreturn
            FieldType::Float => 0xae,                        // freturn
            FieldType::Double => 0xaf,                       // dreturn
            FieldType::Object(_) | FieldType::Array(..) => 0xb0, // areturn
            _ => 0xac,                                       // ireturn
        }
    }

    /// The `dup` variant matching this type's width.
    pub fn dup_opcode(&self) -> u8 {
        match self.slot_width() {
            2 => 0x5c, // dup2
            _ => 0x59, // dup
        }
    }

    /// Static `valueOf` boxing target for a primitive:
    /// `(class, method, descriptor)`. Objects and arrays need no boxing.
    pub fn boxing_ref(&self) -> Option<(&'static str, &'static str, &'static str)> {
        match self {
            FieldType::Byte => Some(("java/lang/Byte", "valueOf", "(B)Ljava/lang/Byte;")),
            FieldType::Char => Some(("java/lang/Character", "valueOf", "(C)Ljava/lang/Character;")),
            FieldType::Double => Some(("java/lang/Double", "valueOf", "(D)Ljava/lang/Double;")),
            FieldType::Float => Some(("java/lang/Float", "valueOf", "(F)Ljava/lang/Float;")),
            FieldType::Int => Some(("java/lang/Integer", "valueOf", "(I)Ljava/lang/Integer;")),
            FieldType::Long => Some(("java/lang/Long", "valueOf", "(J)Ljava/lang/Long;")),
            FieldType::Short => Some(("java/lang/Short", "valueOf", "(S)Ljava/lang/Short;")),
            FieldType::Boolean => Some(("java/lang/Boolean", "valueOf", "(Z)Ljava/lang/Boolean;")),
            FieldType::Object(_) | FieldType::Array(..) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    /// `None` for void.
    pub return_type: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Result<Self, ClassFileError> {
        let bad = || ClassFileError::BadDescriptor(descriptor.to_string());
        let mut chars = descriptor.chars().peekable();
        if chars.next() != Some('(') {
            return Err(bad());
        }
        let mut parameters = Vec::new();
        loop {
            match chars.peek() {
                Some(')') => {
                    chars.next();
                    break;
                }
                Some(_) => parameters.push(parse_field_type(&mut chars).ok_or_else(bad)?),
                None => return Err(bad()),
            }
        }
        let return_type = match chars.peek() {
            Some('V') => {
                chars.next();
                None
            }
            Some(_) => Some(parse_field_type(&mut chars).ok_or_else(bad)?),
            None => return Err(bad()),
        };
        if chars.next().is_some() {
            return Err(bad());
        }
        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }

    /// Local slots consumed by the parameters alone (without `this`).
    pub fn parameter_slots(&self) -> u16 {
        self.parameters.iter().map(FieldType::slot_width).sum()
    }
}

fn parse_field_type(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<FieldType> {
    let mut dims: u8 = 0;
    while chars.peek() == Some(&'[') {
        chars.next();
        dims = dims.checked_add(1)?;
    }
    let base = match chars.next()? {
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'D' => FieldType::Double,
        'F' => FieldType::Float,
        'I' => FieldType::Int,
        'J' => FieldType::Long,
        'S' => FieldType::Short,
        'Z' => FieldType::Boolean,
        'L' => {
            let mut name = String::new();
            loop {
                match chars.next()? {
                    ';' => break,
                    c => name.push(c),
                }
            }
            if name.is_empty() {
                return None;
            }
            FieldType::Object(name)
        }
        _ => return None,
    };
    if dims > 0 {
        Some(FieldType::Array(Box::new(base), dims))
    } else {
        Some(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_descriptor() {
        let d = MethodDescriptor::parse("(IJLjava/lang/String;[[D)V").unwrap();
        assert_eq!(
            d.parameters,
            vec![
                FieldType::Int,
                FieldType::Long,
                FieldType::Object("java/lang/String".to_string()),
                FieldType::Array(Box::new(FieldType::Double), 2),
            ]
        );
        assert_eq!(d.return_type, None);
        // int(1) + long(2) + ref(1) + array ref(1)
        assert_eq!(d.parameter_slots(), 5);
    }

    #[test]
    fn test_parse_return_type() {
        let d = MethodDescriptor::parse("()Ljava/lang/Object;").unwrap();
        assert!(d.parameters.is_empty());
        assert_eq!(
            d.return_type,
            Some(FieldType::Object("java/lang/Object".to_string()))
        );
    }

    #[test]
    fn test_malformed_descriptors_rejected() {
        for s in ["", "()", "(I", "I)V", "(Q)V", "(Ljava/lang/String)V", "()VX"] {
            assert!(
                MethodDescriptor::parse(s).is_err(),
                "descriptor {s:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_opcode_selection() {
        assert_eq!(FieldType::Int.load_opcode(), 0x15);
        assert_eq!(FieldType::Long.load_opcode(), 0x16);
        assert_eq!(
            FieldType::Object("java/lang/String".to_string()).load_opcode(),
            0x19
        );
        assert_eq!(FieldType::Double.return_opcode(), 0xaf);
        assert_eq!(FieldType::Boolean.return_opcode(), 0xac);
        assert_eq!(FieldType::Long.dup_opcode(), 0x5c);
        assert_eq!(FieldType::Int.dup_opcode(), 0x59);
    }

    #[test]
    fn test_boxing_targets() {
        let (class, method, desc) = FieldType::Int.boxing_ref().unwrap();
        assert_eq!((class, method, desc), ("java/lang/Integer", "valueOf", "(I)Ljava/lang/Integer;"));
        assert!(FieldType::Object("java/lang/String".to_string())
            .boxing_ref()
            .is_none());
    }
}
