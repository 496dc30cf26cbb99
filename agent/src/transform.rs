//! Bytecode rewriting: wraps matched methods with probe calls.
//!
//! For every eligible method the original body is moved to a private
//! synthetic duplicate named `<name>$metracer_<nonce>`, and the original
//! slot gets a generated wrapper that reports entry, invokes the duplicate
//! under a catch-all handler, reports the outcome and returns (or rethrows)
//! with the original static type. Calling the duplicate via
//! `invokespecial`/`invokestatic` pins dispatch so an override in a subclass
//! can never re-enter the wrapper.

use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use metracer_classfile::access::{
    ACC_ABSTRACT, ACC_FINAL, ACC_INTERFACE, ACC_NATIVE, ACC_PRIVATE, ACC_PROTECTED, ACC_PUBLIC,
    ACC_STATIC, ACC_SYNTHETIC,
};
use metracer_classfile::{
    ByteWriter, ClassFile, ClassFileError, CodeAttribute, ConstantPool, ExceptionTableEntry,
    FieldType, MethodAttribute, MethodDescriptor, MethodInfo, RawAttribute,
};
use metracer_pattern::{LoaderId, PatternSet};
use thiserror::Error;

/// Internal name of the probe support class the wrappers call into.
pub const PROBE_CLASS: &str = "io/metracer/Probe";

/// Marker embedded in duplicate method names; also guards against
/// re-instrumenting an already rewritten class.
pub const WRAPPER_TAG: &str = "$metracer_";

/// Placeholder argument name when no `LocalVariableTable` is present.
pub const UNKNOWN_ARG: &str = "<unk>";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),
}

// Process-wide so a class retransformed twice in one session gets fresh
// duplicate names.
static NONCE: AtomicU32 = AtomicU32::new(0);

// Opcodes used by the generated wrapper.
const OP_ICONST_0: u8 = 0x03;
const OP_BIPUSH: u8 = 0x10;
const OP_SIPUSH: u8 = 0x11;
const OP_LDC: u8 = 0x12;
const OP_LDC_W: u8 = 0x13;
const OP_AASTORE: u8 = 0x53;
const OP_DUP: u8 = 0x59;
const OP_RETURN: u8 = 0xb1;
const OP_INVOKESPECIAL: u8 = 0xb7;
const OP_INVOKESTATIC: u8 = 0xb8;
const OP_ANEWARRAY: u8 = 0xbd;
const OP_ATHROW: u8 = 0xbf;

/// Rewrite `class_bytes` according to `patterns`.
///
/// Returns `Ok(None)` when nothing in the class matched (the caller keeps
/// the original bytes). The blacklist check runs on the name before any
/// parsing. Interfaces, constructors, static initializers and bodyless
/// methods are never touched.
pub fn transform(
    class_name: &str,
    class_bytes: &[u8],
    loader: LoaderId,
    patterns: &PatternSet,
) -> Result<Option<Vec<u8>>, TransformError> {
    if !patterns.is_class_matched(class_name) {
        return Ok(None);
    }

    let mut class = ClassFile::parse(class_bytes)?;
    if class.access_flags & ACC_INTERFACE != 0 {
        return Ok(None);
    }

    let internal_class = class.name()?.to_string();
    let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
    let mut duplicates: Vec<MethodInfo> = Vec::new();

    for index in 0..class.methods.len() {
        let (name, descriptor_str) = {
            let m = &class.methods[index];
            (
                m.name(&class.constant_pool)?.to_string(),
                m.descriptor(&class.constant_pool)?.to_string(),
            )
        };
        let flags = class.methods[index].access_flags;

        if name.starts_with('<') || name.contains(WRAPPER_TAG) {
            continue;
        }
        if flags & (ACC_ABSTRACT | ACC_NATIVE) != 0 || class.methods[index].code().is_none() {
            continue;
        }
        if !patterns.is_method_matched(class_name, &name) {
            continue;
        }

        let descriptor = MethodDescriptor::parse(&descriptor_str)?;
        let is_static = flags & ACC_STATIC != 0;

        // Argument names come from debug info on the original body.
        let arg_names = {
            let m = &class.methods[index];
            resolve_arg_names(m, &class.constant_pool, &descriptor, is_static)?
        };

        // 1. Duplicate the body under a name virtual dispatch cannot reach.
        let dup_name = format!("{}{}{}", name, WRAPPER_TAG, nonce);
        let mut dup = class.methods[index].clone();
        dup.name_index = class.constant_pool.ensure_utf8(&dup_name)?;
        dup.access_flags =
            (flags & !(ACC_PUBLIC | ACC_PROTECTED)) | ACC_PRIVATE | ACC_FINAL | ACC_SYNTHETIC;
        duplicates.push(dup);

        // 2. Replace the original body with the probe wrapper.
        let wrapper = build_wrapper(
            &mut class.constant_pool,
            &internal_class,
            class_name,
            &name,
            &descriptor_str,
            &descriptor,
            &dup_name,
            is_static,
            &arg_names,
        )?;
        // Reflection-visible metadata (annotations, Exceptions, Signature)
        // stays on the wrapper; only the body moves to the duplicate.
        let code_name_index = class.constant_pool.ensure_utf8("Code")?;
        let mut kept: Vec<MethodAttribute> = class.methods[index]
            .attributes
            .iter()
            .filter(|a| matches!(a, MethodAttribute::Raw(_)))
            .cloned()
            .collect();
        kept.push(MethodAttribute::Code {
            name_index: code_name_index,
            code: wrapper,
        });
        class.methods[index].attributes = kept;

        patterns.register_instrumented(loader, class_name, &format!("{}{}", name, descriptor_str));
        debug!("instrumented {}.{}{}", class_name, name, descriptor_str);
    }

    if duplicates.is_empty() {
        return Ok(None);
    }
    class.methods.extend(duplicates);
    Ok(Some(class.write()))
}

/// Map parameter slots to source names via the `LocalVariableTable`;
/// `<unk>` when the class was compiled without debug info.
fn resolve_arg_names(
    method: &MethodInfo,
    pool: &ConstantPool,
    descriptor: &MethodDescriptor,
    is_static: bool,
) -> Result<Vec<String>, ClassFileError> {
    let table = match method.code() {
        Some(code) => code.local_variables(pool)?,
        None => Vec::new(),
    };
    let mut names = Vec::with_capacity(descriptor.parameters.len());
    let mut slot: u16 = if is_static { 0 } else { 1 };
    for param in &descriptor.parameters {
        let name = table
            .iter()
            .find(|e| e.index == slot && e.start_pc == 0)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| UNKNOWN_ARG.to_string());
        names.push(name);
        slot += param.slot_width();
    }
    Ok(names)
}

#[allow(clippy::too_many_arguments)]
fn build_wrapper(
    pool: &mut ConstantPool,
    internal_class: &str,
    dotted_class: &str,
    method_name: &str,
    descriptor_str: &str,
    descriptor: &MethodDescriptor,
    dup_name: &str,
    is_static: bool,
    arg_names: &[String],
) -> Result<CodeAttribute, ClassFileError> {
    let string_class = pool.ensure_class("java/lang/String")?;
    let object_class = pool.ensure_class("java/lang/Object")?;
    let throwable_class = pool.ensure_class("java/lang/Throwable")?;
    let enter_ref = pool.ensure_methodref(
        PROBE_CLASS,
        "enter",
        "(Ljava/lang/String;Ljava/lang/String;[Ljava/lang/String;[Ljava/lang/Object;)V",
    )?;
    let exit_return_ref = pool.ensure_methodref(
        PROBE_CLASS,
        "exitReturn",
        "(Ljava/lang/Object;Ljava/lang/String;Ljava/lang/String;)V",
    )?;
    let exit_void_ref = pool.ensure_methodref(
        PROBE_CLASS,
        "exitVoid",
        "(Ljava/lang/String;Ljava/lang/String;)V",
    )?;
    let exit_throw_ref = pool.ensure_methodref(
        PROBE_CLASS,
        "exitThrow",
        "(Ljava/lang/Throwable;Ljava/lang/String;Ljava/lang/String;)V",
    )?;
    let dup_ref = pool.ensure_methodref(internal_class, dup_name, descriptor_str)?;
    let class_str = pool.ensure_string(dotted_class)?;
    let method_str = pool.ensure_string(method_name)?;

    let n = descriptor.parameters.len();
    let this_width: u16 = if is_static { 0 } else { 1 };
    let param_slots = descriptor.parameter_slots();

    let mut code = ByteWriter::with_capacity(64 + 16 * n);

    // --- entry report -------------------------------------------------
    emit_ldc(&mut code, class_str);
    emit_ldc(&mut code, method_str);
    emit_iconst(&mut code, n as i32);
    code.u1(OP_ANEWARRAY);
    code.u2(string_class);
    for (i, name) in arg_names.iter().enumerate() {
        let name_str = pool.ensure_string(name)?;
        code.u1(OP_DUP);
        emit_iconst(&mut code, i as i32);
        emit_ldc(&mut code, name_str);
        code.u1(OP_AASTORE);
    }
    emit_iconst(&mut code, n as i32);
    code.u1(OP_ANEWARRAY);
    code.u2(object_class);
    let mut slot = this_width;
    for (i, param) in descriptor.parameters.iter().enumerate() {
        code.u1(OP_DUP);
        emit_iconst(&mut code, i as i32);
        emit_load(&mut code, param, slot);
        emit_boxing(&mut code, pool, param)?;
        code.u1(OP_AASTORE);
        slot += param.slot_width();
    }
    code.u1(OP_INVOKESTATIC);
    code.u2(enter_ref);

    // --- guarded call of the duplicate --------------------------------
    let start_pc = code.len() as u16;
    if !is_static {
        emit_load(&mut code, &FieldType::Object(String::new()), 0);
    }
    let mut slot = this_width;
    for param in &descriptor.parameters {
        emit_load(&mut code, param, slot);
        slot += param.slot_width();
    }
    code.u1(if is_static {
        OP_INVOKESTATIC
    } else {
        OP_INVOKESPECIAL
    });
    code.u2(dup_ref);

    match &descriptor.return_type {
        None => {
            emit_ldc(&mut code, class_str);
            emit_ldc(&mut code, method_str);
            code.u1(OP_INVOKESTATIC);
            code.u2(exit_void_ref);
            code.u1(OP_RETURN);
        }
        Some(ret) => {
            code.u1(ret.dup_opcode());
            emit_boxing(&mut code, pool, ret)?;
            emit_ldc(&mut code, class_str);
            emit_ldc(&mut code, method_str);
            code.u1(OP_INVOKESTATIC);
            code.u2(exit_return_ref);
            code.u1(ret.return_opcode());
        }
    }

    // --- catch-all handler: report and rethrow ------------------------
    let handler_pc = code.len() as u16;
    code.u1(OP_DUP);
    emit_ldc(&mut code, class_str);
    emit_ldc(&mut code, method_str);
    code.u1(OP_INVOKESTATIC);
    code.u2(exit_throw_ref);
    code.u1(OP_ATHROW);

    let stack_map = build_stack_map(
        pool,
        internal_class,
        descriptor,
        is_static,
        handler_pc,
        throwable_class,
    )?;

    let ret_width = descriptor
        .return_type
        .as_ref()
        .map(FieldType::slot_width)
        .unwrap_or(0);
    let entry_max = if n > 0 {
        let widest = descriptor
            .parameters
            .iter()
            .map(FieldType::slot_width)
            .max()
            .unwrap_or(1);
        6 + widest
    } else {
        4
    };
    let call_max = this_width + param_slots;
    let exit_max = ret_width * 2 + 1 + 2; // dup'd value, boxed copy, two strings
    let max_stack = entry_max.max(call_max).max(exit_max).max(4);

    Ok(CodeAttribute {
        max_stack,
        max_locals: this_width + param_slots,
        code: code.into_vec(),
        exception_table: vec![ExceptionTableEntry {
            start_pc,
            end_pc: handler_pc,
            handler_pc,
            catch_type: 0,
        }],
        attributes: vec![stack_map],
    })
}

/// One `full_frame` at the handler: locals are the untouched parameters,
/// the operand stack holds the caught `Throwable`. That is the only place
/// control flow merges, so one frame satisfies the verifier.
fn build_stack_map(
    pool: &mut ConstantPool,
    internal_class: &str,
    descriptor: &MethodDescriptor,
    is_static: bool,
    handler_pc: u16,
    throwable_class: u16,
) -> Result<RawAttribute, ClassFileError> {
    const ITEM_INTEGER: u8 = 1;
    const ITEM_FLOAT: u8 = 2;
    const ITEM_DOUBLE: u8 = 3;
    const ITEM_LONG: u8 = 4;
    const ITEM_OBJECT: u8 = 7;
    const FULL_FRAME: u8 = 255;

    let mut locals: Vec<(u8, Option<u16>)> = Vec::new();
    if !is_static {
        locals.push((ITEM_OBJECT, Some(pool.ensure_class(internal_class)?)));
    }
    for param in &descriptor.parameters {
        let entry = match param {
            FieldType::Float => (ITEM_FLOAT, None),
            FieldType::Double => (ITEM_DOUBLE, None),
            FieldType::Long => (ITEM_LONG, None),
            FieldType::Object(name) => (ITEM_OBJECT, Some(pool.ensure_class(name)?)),
            FieldType::Array(..) => {
                (ITEM_OBJECT, Some(pool.ensure_class(&descriptor_of(param))?))
            }
            _ => (ITEM_INTEGER, None),
        };
        locals.push(entry);
    }

    let mut w = ByteWriter::new();
    w.u2(1); // one entry
    w.u1(FULL_FRAME);
    w.u2(handler_pc); // offset_delta of the first frame is the absolute pc
    w.u2(locals.len() as u16);
    for (tag, index) in &locals {
        w.u1(*tag);
        if let Some(index) = index {
            w.u2(*index);
        }
    }
    w.u2(1); // stack: the caught throwable
    w.u1(ITEM_OBJECT);
    w.u2(throwable_class);

    Ok(RawAttribute {
        name_index: pool.ensure_utf8("StackMapTable")?,
        info: w.into_vec(),
    })
}

/// Field descriptor text, e.g. `[[D` or `Ljava/lang/String;`.
fn descriptor_of(ft: &FieldType) -> String {
    match ft {
        FieldType::Byte => "B".to_string(),
        FieldType::Char => "C".to_string(),
        FieldType::Double => "D".to_string(),
        FieldType::Float => "F".to_string(),
        FieldType::Int => "I".to_string(),
        FieldType::Long => "J".to_string(),
        FieldType::Short => "S".to_string(),
        FieldType::Boolean => "Z".to_string(),
        FieldType::Object(name) => format!("L{};", name),
        FieldType::Array(elem, dims) => {
            format!("{}{}", "[".repeat(*dims as usize), descriptor_of(elem))
        }
    }
}

fn emit_ldc(code: &mut ByteWriter, index: u16) {
    if index <= u16::from(u8::MAX) {
        code.u1(OP_LDC);
        code.u1(index as u8);
    } else {
        code.u1(OP_LDC_W);
        code.u2(index);
    }
}

fn emit_iconst(code: &mut ByteWriter, value: i32) {
    match value {
        0..=5 => code.u1(OP_ICONST_0 + value as u8),
        -128..=127 => {
            code.u1(OP_BIPUSH);
            code.u1(value as u8);
        }
        _ => {
            code.u1(OP_SIPUSH);
            code.u2(value as u16);
        }
    }
}

fn emit_load(code: &mut ByteWriter, ft: &FieldType, slot: u16) {
    let opcode = ft.load_opcode();
    if slot <= 3 {
        // iload_0 .. aload_3 are contiguous blocks of four per type.
        let short_base = match opcode {
            0x15 => 0x1a, // iload_n
            0x16 => 0x1e, // lload_n
            0x17 => 0x22, // fload_n
            0x18 => 0x26, // dload_n
            _ => 0x2a,    // aload_n
        };
        code.u1(short_base + slot as u8);
    } else {
        code.u1(opcode);
        code.u1(slot as u8);
    }
}

fn emit_boxing(
    code: &mut ByteWriter,
    pool: &mut ConstantPool,
    ft: &FieldType,
) -> Result<(), ClassFileError> {
    if let Some((class, method, desc)) = ft.boxing_ref() {
        let boxing = pool.ensure_methodref(class, method, desc)?;
        code.u1(OP_INVOKESTATIC);
        code.u2(boxing);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use metracer_classfile::access::ACC_PUBLIC;
    use metracer_protocol::StackTraceMode;

    fn patterns(class: &str, method: Option<&str>) -> PatternSet {
        PatternSet::compile(class, method, StackTraceMode::Disabled).unwrap()
    }

    /// `public class com/app/Worker { int doWork(int); void idle(); }`
    fn worker_class() -> Vec<u8> {
        let mut pool = ConstantPool::new();
        let this_class = pool.ensure_class("com/app/Worker").unwrap();
        let super_class = pool.ensure_class("java/lang/Object").unwrap();
        let code_name = pool.ensure_utf8("Code").unwrap();
        let do_work = pool.ensure_utf8("doWork").unwrap();
        let do_work_desc = pool.ensure_utf8("(I)I").unwrap();
        let idle = pool.ensure_utf8("idle").unwrap();
        let idle_desc = pool.ensure_utf8("()V").unwrap();

        let method = |name_index, descriptor_index, body: Vec<u8>, stack, locals| MethodInfo {
            access_flags: ACC_PUBLIC,
            name_index,
            descriptor_index,
            attributes: vec![MethodAttribute::Code {
                name_index: code_name,
                code: CodeAttribute {
                    max_stack: stack,
                    max_locals: locals,
                    code: body,
                    exception_table: Vec::new(),
                    attributes: Vec::new(),
                },
            }],
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
            methods: vec![
                method(do_work, do_work_desc, vec![0x1b, 0xac], 1, 2), // iload_1; ireturn
                method(idle, idle_desc, vec![0xb1], 0, 1),             // return
            ],
            attributes: Vec::new(),
        }
        .write()
    }

    fn method_names(bytes: &[u8]) -> Vec<String> {
        let class = ClassFile::parse(bytes).unwrap();
        class
            .methods
            .iter()
            .map(|m| m.name(&class.constant_pool).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_unmatched_class_is_untouched() {
        let bytes = worker_class();
        let p = patterns("com\\.other\\..*", None);
        assert!(transform("com.app.Worker", &bytes, LoaderId(0), &p)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_blacklisted_class_is_rejected_before_parsing() {
        // Garbage bytes prove the name check short-circuits the parser.
        let p = patterns(".*", None);
        assert!(
            transform("io.metracer.Probe", &[0xde, 0xad], LoaderId(0), &p)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_matched_method_gets_wrapper_and_duplicate() {
        let bytes = worker_class();
        let p = patterns("com\\.app\\..*", Some("doWork"));
        let out = transform("com.app.Worker", &bytes, LoaderId(0), &p)
            .unwrap()
            .expect("class should change");

        let names = method_names(&out);
        assert!(names.contains(&"doWork".to_string()));
        assert!(names.contains(&"idle".to_string()));
        assert_eq!(
            names
                .iter()
                .filter(|n| n.starts_with("doWork$metracer_"))
                .count(),
            1
        );
        // idle did not match the method pattern; no duplicate for it.
        assert!(!names.iter().any(|n| n.starts_with("idle$metracer_")));
        assert_eq!(p.instrumented_count(), 1);
    }

    #[test]
    fn test_duplicate_is_private_synthetic_final() {
        let bytes = worker_class();
        let p = patterns("com\\.app\\..*", None);
        let out = transform("com.app.Worker", &bytes, LoaderId(0), &p)
            .unwrap()
            .unwrap();
        let class = ClassFile::parse(&out).unwrap();
        let dup = class
            .methods
            .iter()
            .find(|m| {
                m.name(&class.constant_pool)
                    .unwrap()
                    .starts_with("doWork$metracer_")
            })
            .unwrap();
        assert_ne!(dup.access_flags & ACC_PRIVATE, 0);
        assert_ne!(dup.access_flags & ACC_SYNTHETIC, 0);
        assert_ne!(dup.access_flags & ACC_FINAL, 0);
        assert_eq!(dup.access_flags & ACC_PUBLIC, 0);
    }

    #[test]
    fn test_wrapper_has_catch_all_region_and_stack_map() {
        let bytes = worker_class();
        let p = patterns("com\\.app\\..*", Some("doWork"));
        let out = transform("com.app.Worker", &bytes, LoaderId(0), &p)
            .unwrap()
            .unwrap();
        let class = ClassFile::parse(&out).unwrap();
        let wrapper = class
            .methods
            .iter()
            .find(|m| m.name(&class.constant_pool).unwrap() == "doWork")
            .unwrap();
        let code = wrapper.code().unwrap();

        assert_eq!(code.exception_table.len(), 1);
        let region = code.exception_table[0];
        assert_eq!(region.catch_type, 0, "catch-all");
        assert_eq!(region.end_pc, region.handler_pc);
        assert!(region.start_pc < region.end_pc);

        let has_stack_map = code.attributes.iter().any(|a| {
            class.constant_pool.get_utf8(a.name_index).unwrap() == "StackMapTable"
        });
        assert!(has_stack_map);
    }

    #[test]
    fn test_instrumented_class_reparses_and_survives_reinstrumentation() {
        let bytes = worker_class();
        let p = patterns("com\\.app\\..*", None);
        let once = transform("com.app.Worker", &bytes, LoaderId(0), &p)
            .unwrap()
            .unwrap();

        // A second pass over already-wrapped bytes must skip the duplicates
        // but may rewrap the originals; duplicate names stay unique.
        let twice = transform("com.app.Worker", &once, LoaderId(0), &p)
            .unwrap()
            .unwrap();
        let names = method_names(&twice);
        let dups: Vec<_> = names
            .iter()
            .filter(|n| n.contains(WRAPPER_TAG))
            .collect();
        let unique: std::collections::HashSet<_> = dups.iter().collect();
        assert_eq!(dups.len(), unique.len(), "duplicate names collide");
    }

    #[test]
    fn test_registry_key_includes_descriptor() {
        let bytes = worker_class();
        let p = patterns("com\\.app\\..*", Some("doWork"));
        transform("com.app.Worker", &bytes, LoaderId(7), &p)
            .unwrap()
            .unwrap();
        let keys = p.registry().snapshot();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].class_name, "com.app.Worker");
        assert_eq!(keys[0].method, "doWork(I)I");
        assert_eq!(keys[0].loader, LoaderId(7));
    }

    #[test]
    fn test_interfaces_are_skipped() {
        let mut class = ClassFile::parse(&worker_class()).unwrap();
        class.access_flags |= ACC_INTERFACE;
        let bytes = class.write();
        let p = patterns("com\\.app\\..*", None);
        assert!(transform("com.app.Worker", &bytes, LoaderId(0), &p)
            .unwrap()
            .is_none());
    }
}
