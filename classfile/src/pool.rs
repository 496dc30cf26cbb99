//! Constant pool: parsing, writing, and append-only building.
//!
//! The transformer only ever appends entries (Utf8, Class, String,
//! NameAndType, Methodref); existing indices stay valid, which is what keeps
//! the rest of the class byte-stable across a rewrite.

use crate::error::ClassFileError;
use crate::reader::ByteReader;
use crate::writer::ByteWriter;

#[derive(Debug, Clone, PartialEq)]
pub enum CpInfo {
    /// Raw bytes as stored in the class file. The JVM uses modified UTF-8
    /// (NUL as `0xC0 0x80`, supplementary characters as surrogate pairs),
    /// which is not always valid standard UTF-8, so decoding is deferred to
    /// `get_utf8` and only ever applied to names and descriptors.
    Utf8(Vec<u8>),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

/// Index 0 is unused; `Long`/`Double` occupy two slots (the second is `None`).
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<Option<CpInfo>>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![None],
        }
    }

    pub fn get(&self, index: u16) -> Result<&CpInfo, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::BadPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::BadPoolIndex(index))
    }

    /// Decode a `Utf8` entry as a string. Names and descriptors never use
    /// the code points where modified UTF-8 diverges from standard UTF-8,
    /// so a decode failure means the entry is not a name.
    pub fn get_utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Utf8(bytes) => {
                std::str::from_utf8(bytes).map_err(|_| ClassFileError::MalformedUtf8(index))
            }
            _ => Err(ClassFileError::BadPoolIndex(index)),
        }
    }

    /// Resolve a `Class` entry to its internal name (`com/app/Worker`).
    pub fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.get_utf8(*name_index),
            _ => Err(ClassFileError::BadPoolIndex(index)),
        }
    }

    /// Total slot count, as written in the `constant_pool_count` field.
    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    // ---- building -----------------------------------------------------

    fn push(&mut self, entry: CpInfo) -> Result<u16, ClassFileError> {
        let index = self.entries.len();
        if index >= 0xFFFF {
            return Err(ClassFileError::PoolOverflow);
        }
        let two_slots = matches!(entry, CpInfo::Long(_) | CpInfo::Double(_));
        self.entries.push(Some(entry));
        if two_slots {
            self.entries.push(None);
        }
        Ok(index as u16)
    }

    fn find(&self, wanted: &CpInfo) -> Option<u16> {
        self.entries
            .iter()
            .position(|e| e.as_ref() == Some(wanted))
            .map(|i| i as u16)
    }

    fn ensure(&mut self, entry: CpInfo) -> Result<u16, ClassFileError> {
        match self.find(&entry) {
            Some(i) => Ok(i),
            None => self.push(entry),
        }
    }

    pub fn ensure_utf8(&mut self, text: &str) -> Result<u16, ClassFileError> {
        self.ensure(CpInfo::Utf8(text.as_bytes().to_vec()))
    }

    /// `name` in internal form, e.g. `io/metracer/Probe`.
    pub fn ensure_class(&mut self, name: &str) -> Result<u16, ClassFileError> {
        let name_index = self.ensure_utf8(name)?;
        self.ensure(CpInfo::Class { name_index })
    }

    pub fn ensure_string(&mut self, text: &str) -> Result<u16, ClassFileError> {
        let string_index = self.ensure_utf8(text)?;
        self.ensure(CpInfo::String { string_index })
    }

    pub fn ensure_name_and_type(
        &mut self,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let name_index = self.ensure_utf8(name)?;
        let descriptor_index = self.ensure_utf8(descriptor)?;
        self.ensure(CpInfo::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn ensure_methodref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let class_index = self.ensure_class(class)?;
        let name_and_type_index = self.ensure_name_and_type(name, descriptor)?;
        self.ensure(CpInfo::Methodref {
            class_index,
            name_and_type_index,
        })
    }

    // ---- wire form ----------------------------------------------------

    pub(crate) fn parse(r: &mut ByteReader) -> Result<Self, ClassFileError> {
        let count = r.read_u2()? as usize;
        let mut entries: Vec<Option<CpInfo>> = Vec::with_capacity(count);
        entries.push(None);

        let mut i = 1;
        while i < count {
            let tag = r.read_u1()?;
            let entry = match tag {
                1 => {
                    let len = r.read_u2()? as usize;
                    let bytes = r.read_bytes(len)?;
                    CpInfo::Utf8(bytes.to_vec())
                }
                3 => CpInfo::Integer(r.read_u4()? as i32),
                4 => CpInfo::Float(f32::from_bits(r.read_u4()?)),
                5 => {
                    let high = r.read_u4()? as u64;
                    let low = r.read_u4()? as u64;
                    entries.push(Some(CpInfo::Long(((high << 32) | low) as i64)));
                    entries.push(None);
                    i += 2;
                    continue;
                }
                6 => {
                    let high = r.read_u4()? as u64;
                    let low = r.read_u4()? as u64;
                    entries.push(Some(CpInfo::Double(f64::from_bits((high << 32) | low))));
                    entries.push(None);
                    i += 2;
                    continue;
                }
                7 => CpInfo::Class { name_index: r.read_u2()? },
                8 => CpInfo::String { string_index: r.read_u2()? },
                9 => CpInfo::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
                10 => CpInfo::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
                11 => CpInfo::InterfaceMethodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
                12 => CpInfo::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
                15 => CpInfo::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? },
                16 => CpInfo::MethodType { descriptor_index: r.read_u2()? },
                17 => CpInfo::Dynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
                18 => CpInfo::InvokeDynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
                19 => CpInfo::Module { name_index: r.read_u2()? },
                20 => CpInfo::Package { name_index: r.read_u2()? },
                _ => return Err(ClassFileError::BadPoolTag(tag)),
            };
            entries.push(Some(entry));
            i += 1;
        }

        Ok(ConstantPool { entries })
    }

    pub(crate) fn write(&self, w: &mut ByteWriter) {
        w.u2(self.count());
        for entry in self.entries.iter().flatten() {
            match entry {
                CpInfo::Utf8(bytes) => {
                    w.u1(1);
                    w.u2(bytes.len() as u16);
                    w.bytes(bytes);
                }
                CpInfo::Integer(v) => {
                    w.u1(3);
                    w.u4(*v as u32);
                }
                CpInfo::Float(v) => {
                    w.u1(4);
                    w.u4(v.to_bits());
                }
                CpInfo::Long(v) => {
                    w.u1(5);
                    let bits = *v as u64;
                    w.u4((bits >> 32) as u32);
                    w.u4(bits as u32);
                }
                CpInfo::Double(v) => {
                    w.u1(6);
                    let bits = v.to_bits();
                    w.u4((bits >> 32) as u32);
                    w.u4(bits as u32);
                }
                CpInfo::Class { name_index } => {
                    w.u1(7);
                    w.u2(*name_index);
                }
                CpInfo::String { string_index } => {
                    w.u1(8);
                    w.u2(*string_index);
                }
                CpInfo::Fieldref { class_index, name_and_type_index } => {
                    w.u1(9);
                    w.u2(*class_index);
                    w.u2(*name_and_type_index);
                }
                CpInfo::Methodref { class_index, name_and_type_index } => {
                    w.u1(10);
                    w.u2(*class_index);
                    w.u2(*name_and_type_index);
                }
                CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                    w.u1(11);
                    w.u2(*class_index);
                    w.u2(*name_and_type_index);
                }
                CpInfo::NameAndType { name_index, descriptor_index } => {
                    w.u1(12);
                    w.u2(*name_index);
                    w.u2(*descriptor_index);
                }
                CpInfo::MethodHandle { reference_kind, reference_index } => {
                    w.u1(15);
                    w.u1(*reference_kind);
                    w.u2(*reference_index);
                }
                CpInfo::MethodType { descriptor_index } => {
                    w.u1(16);
                    w.u2(*descriptor_index);
                }
                CpInfo::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    w.u1(17);
                    w.u2(*bootstrap_method_attr_index);
                    w.u2(*name_and_type_index);
                }
                CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    w.u1(18);
                    w.u2(*bootstrap_method_attr_index);
                    w.u2(*name_and_type_index);
                }
                CpInfo::Module { name_index } => {
                    w.u1(19);
                    w.u2(*name_index);
                }
                CpInfo::Package { name_index } => {
                    w.u1(20);
                    w.u2(*name_index);
                }
            }
        }
    }
}
