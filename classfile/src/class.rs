//! Class file skeleton: parse, inspect, rewrite, write.

use crate::error::ClassFileError;
use crate::pool::ConstantPool;
use crate::reader::ByteReader;
use crate::writer::ByteWriter;

const MAGIC: u32 = 0xCAFE_BABE;

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<RawAttribute>,
}

/// An attribute kept as opaque bytes; round-trips unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAttribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<MethodAttribute>,
}

/// Method attributes: `Code` is structural, everything else opaque.
#[derive(Debug, Clone)]
pub enum MethodAttribute {
    Code { name_index: u16, code: CodeAttribute },
    Raw(RawAttribute),
}

#[derive(Debug, Clone, Default)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    /// Sub-attributes (LineNumberTable, LocalVariableTable, StackMapTable,
    /// ...) kept opaque; `local_variables` parses on demand.
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// 0 catches everything.
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name: String,
    pub descriptor: String,
    pub index: u16,
}

impl MethodInfo {
    pub fn name<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        pool.get_utf8(self.name_index)
    }

    pub fn descriptor<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        pool.get_utf8(self.descriptor_index)
    }

    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|a| match a {
            MethodAttribute::Code { code, .. } => Some(code),
            MethodAttribute::Raw(_) => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeAttribute> {
        self.attributes.iter_mut().find_map(|a| match a {
            MethodAttribute::Code { code, .. } => Some(code),
            MethodAttribute::Raw(_) => None,
        })
    }
}

impl CodeAttribute {
    /// Parse the `LocalVariableTable` sub-attribute if the class was
    /// compiled with debug info.
    pub fn local_variables(
        &self,
        pool: &ConstantPool,
    ) -> Result<Vec<LocalVariableEntry>, ClassFileError> {
        for attr in &self.attributes {
            if pool.get_utf8(attr.name_index)? != "LocalVariableTable" {
                continue;
            }
            let mut r = ByteReader::new(&attr.info);
            let count = r.read_u2()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let start_pc = r.read_u2()?;
                let length = r.read_u2()?;
                let name = pool.get_utf8(r.read_u2()?)?.to_string();
                let descriptor = pool.get_utf8(r.read_u2()?)?.to_string();
                let index = r.read_u2()?;
                entries.push(LocalVariableEntry {
                    start_pc,
                    length,
                    name,
                    descriptor,
                    index,
                });
            }
            return Ok(entries);
        }
        Ok(Vec::new())
    }
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = ByteReader::new(bytes);
        let magic = r.read_u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }
        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;
        let constant_pool = ConstantPool::parse(&mut r)?;
        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;

        let interfaces_count = r.read_u2()? as usize;
        let mut interfaces = Vec::with_capacity(interfaces_count);
        for _ in 0..interfaces_count {
            interfaces.push(r.read_u2()?);
        }

        let fields_count = r.read_u2()? as usize;
        let mut fields = Vec::with_capacity(fields_count);
        for _ in 0..fields_count {
            let access_flags = r.read_u2()?;
            let name_index = r.read_u2()?;
            let descriptor_index = r.read_u2()?;
            let attributes = parse_raw_attributes(&mut r)?;
            fields.push(FieldInfo {
                access_flags,
                name_index,
                descriptor_index,
                attributes,
            });
        }

        let methods_count = r.read_u2()? as usize;
        let mut methods = Vec::with_capacity(methods_count);
        for _ in 0..methods_count {
            methods.push(parse_method(&mut r, &constant_pool)?);
        }

        let attributes = parse_raw_attributes(&mut r)?;

        Ok(ClassFile {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    /// Internal name of this class (`com/app/Worker`).
    pub fn name(&self) -> Result<&str, ClassFileError> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn write(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(1024);
        w.u4(MAGIC);
        w.u2(self.minor_version);
        w.u2(self.major_version);
        self.constant_pool.write(&mut w);
        w.u2(self.access_flags);
        w.u2(self.this_class);
        w.u2(self.super_class);
        w.u2(self.interfaces.len() as u16);
        for i in &self.interfaces {
            w.u2(*i);
        }
        w.u2(self.fields.len() as u16);
        for f in &self.fields {
            w.u2(f.access_flags);
            w.u2(f.name_index);
            w.u2(f.descriptor_index);
            write_raw_attributes(&mut w, &f.attributes);
        }
        w.u2(self.methods.len() as u16);
        for m in &self.methods {
            write_method(&mut w, m);
        }
        write_raw_attributes(&mut w, &self.attributes);
        w.into_vec()
    }
}

fn parse_method(r: &mut ByteReader, pool: &ConstantPool) -> Result<MethodInfo, ClassFileError> {
    let access_flags = r.read_u2()?;
    let name_index = r.read_u2()?;
    let descriptor_index = r.read_u2()?;
    let count = r.read_u2()? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        let attr_name_index = r.read_u2()?;
        let length = r.read_u4()? as usize;
        let info = r.read_bytes(length)?;
        if pool.get_utf8(attr_name_index)? == "Code" {
            let mut sub = ByteReader::new(info);
            let code = parse_code(&mut sub)?;
            if sub.remaining() != 0 {
                return Err(ClassFileError::MalformedAttribute("Code".to_string()));
            }
            attributes.push(MethodAttribute::Code {
                name_index: attr_name_index,
                code,
            });
        } else {
            attributes.push(MethodAttribute::Raw(RawAttribute {
                name_index: attr_name_index,
                info: info.to_vec(),
            }));
        }
    }
    Ok(MethodInfo {
        access_flags,
        name_index,
        descriptor_index,
        attributes,
    })
}

fn parse_code(r: &mut ByteReader) -> Result<CodeAttribute, ClassFileError> {
    let max_stack = r.read_u2()?;
    let max_locals = r.read_u2()?;
    let code_length = r.read_u4()? as usize;
    let code = r.read_bytes(code_length)?.to_vec();
    let table_length = r.read_u2()? as usize;
    let mut exception_table = Vec::with_capacity(table_length);
    for _ in 0..table_length {
        exception_table.push(ExceptionTableEntry {
            start_pc: r.read_u2()?,
            end_pc: r.read_u2()?,
            handler_pc: r.read_u2()?,
            catch_type: r.read_u2()?,
        });
    }
    let attributes = parse_raw_attributes(r)?;
    Ok(CodeAttribute {
        max_stack,
        max_locals,
        code,
        exception_table,
        attributes,
    })
}

fn parse_raw_attributes(r: &mut ByteReader) -> Result<Vec<RawAttribute>, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut attrs = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = r.read_u2()?;
        let length = r.read_u4()? as usize;
        let info = r.read_bytes(length)?.to_vec();
        attrs.push(RawAttribute { name_index, info });
    }
    Ok(attrs)
}

fn write_raw_attributes(w: &mut ByteWriter, attrs: &[RawAttribute]) {
    w.u2(attrs.len() as u16);
    for attr in attrs {
        w.u2(attr.name_index);
        w.u4(attr.info.len() as u32);
        w.bytes(&attr.info);
    }
}

fn write_method(w: &mut ByteWriter, m: &MethodInfo) {
    w.u2(m.access_flags);
    w.u2(m.name_index);
    w.u2(m.descriptor_index);
    w.u2(m.attributes.len() as u16);
    for attr in &m.attributes {
        match attr {
            MethodAttribute::Raw(raw) => {
                w.u2(raw.name_index);
                w.u4(raw.info.len() as u32);
                w.bytes(&raw.info);
            }
            MethodAttribute::Code { name_index, code } => {
                let mut body = ByteWriter::with_capacity(code.code.len() + 32);
                body.u2(code.max_stack);
                body.u2(code.max_locals);
                body.u4(code.code.len() as u32);
                body.bytes(&code.code);
                body.u2(code.exception_table.len() as u16);
                for e in &code.exception_table {
                    body.u2(e.start_pc);
                    body.u2(e.end_pc);
                    body.u2(e.handler_pc);
                    body.u2(e.catch_type);
                }
                write_raw_attributes(&mut body, &code.attributes);
                let body = body.into_vec();
                w.u2(*name_index);
                w.u4(body.len() as u32);
                w.bytes(&body);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::*;

    /// Build a minimal but complete class by hand:
    /// `public class a/B { static int add(int, int); }`.
    pub(crate) fn sample_class() -> ClassFile {
        let mut pool = ConstantPool::new();
        let this_class = pool.ensure_class("a/B").unwrap();
        let super_class = pool.ensure_class("java/lang/Object").unwrap();
        let name_index = pool.ensure_utf8("add").unwrap();
        let descriptor_index = pool.ensure_utf8("(II)I").unwrap();
        let code_name = pool.ensure_utf8("Code").unwrap();

        // iload_0, iload_1, iadd, ireturn
        let code = CodeAttribute {
            max_stack: 2,
            max_locals: 2,
            code: vec![0x1a, 0x1b, 0x60, 0xac],
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };

        ClassFile {
            minor_version: 0,
            major_version: 52,
            constant_pool: pool,
            access_flags: ACC_PUBLIC,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: vec![MethodInfo {
                access_flags: ACC_STATIC,
                name_index,
                descriptor_index,
                attributes: vec![MethodAttribute::Code {
                    name_index: code_name,
                    code,
                }],
            }],
            attributes: Vec::new(),
        }
    }

    #[test]
    fn test_write_then_parse_preserves_structure() {
        let class = sample_class();
        let bytes = class.write();
        let parsed = ClassFile::parse(&bytes).unwrap();

        assert_eq!(parsed.name().unwrap(), "a/B");
        assert_eq!(parsed.major_version, 52);
        assert_eq!(parsed.methods.len(), 1);
        let m = &parsed.methods[0];
        assert_eq!(m.name(&parsed.constant_pool).unwrap(), "add");
        assert_eq!(m.descriptor(&parsed.constant_pool).unwrap(), "(II)I");
        let code = m.code().expect("code attribute");
        assert_eq!(code.code, vec![0x1a, 0x1b, 0x60, 0xac]);
    }

    #[test]
    fn test_roundtrip_is_byte_identical() {
        let bytes = sample_class().write();
        let reparsed = ClassFile::parse(&bytes).unwrap();
        assert_eq!(reparsed.write(), bytes);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let err = ClassFile::parse(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, ClassFileError::InvalidMagic(0)));
    }

    #[test]
    fn test_truncated_class_rejected() {
        let mut bytes = sample_class().write();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            ClassFile::parse(&bytes).unwrap_err(),
            ClassFileError::UnexpectedEof
        ));
    }

    #[test]
    fn test_unknown_attributes_roundtrip_as_bytes() {
        let mut class = sample_class();
        let name_index = class.constant_pool.ensure_utf8("SourceFile").unwrap();
        let file_index = class.constant_pool.ensure_utf8("B.java").unwrap();
        class.attributes.push(RawAttribute {
            name_index,
            info: file_index.to_be_bytes().to_vec(),
        });
        let bytes = class.write();
        let parsed = ClassFile::parse(&bytes).unwrap();
        assert_eq!(parsed.attributes.len(), 1);
        assert_eq!(parsed.attributes[0].info, file_index.to_be_bytes().to_vec());
        assert_eq!(parsed.write(), bytes);
    }
}
