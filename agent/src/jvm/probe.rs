//! The `io.metracer.Probe` helper class and its native implementations.
//!
//! Wrappers generated by the transformer call four static natives on this
//! class. The class itself is synthesized from scratch with the classfile
//! writer, defined on the bootstrap path, and bound to the `probe_*`
//! functions below via `RegisterNatives`. The natives convert their JNI
//! arguments into [`Value`]s and hand them to the agent's trace runtime.

use std::ffi::CString;
use std::os::raw::c_void;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use log::warn;
use metracer_classfile::access::{
    ACC_FINAL, ACC_NATIVE, ACC_PUBLIC, ACC_STATIC, ACC_SUPER, ACC_SYNTHETIC,
};
use metracer_classfile::{ClassFile, ConstantPool, MethodInfo};

use crate::transform::{PROBE_CLASS, UNKNOWN_ARG};
use crate::tracing::Value;

use super::env::JniEnv;
use super::sys::jni::{
    jclass, jmethodID, jobject, jobjectArray, jstring, JNIEnv, JNINativeMethod,
};

/// Containers nested deeper than this render as their `toString()`.
const MAX_CONVERSION_DEPTH: u32 = 3;

/// One more than the render bound, so the `, ...` marker still appears for
/// oversized containers without copying them wholesale.
const MAX_CONVERTED_ELEMENTS: i32 = 33;

struct MethodSpec {
    name: &'static str,
    descriptor: &'static str,
    native: *mut c_void,
}

fn probe_methods() -> [MethodSpec; 4] {
    [
        MethodSpec {
            name: "enter",
            descriptor: "(Ljava/lang/String;Ljava/lang/String;[Ljava/lang/String;[Ljava/lang/Object;)V",
            native: probe_enter as *mut c_void,
        },
        MethodSpec {
            name: "exitReturn",
            descriptor: "(Ljava/lang/Object;Ljava/lang/String;Ljava/lang/String;)V",
            native: probe_exit_return as *mut c_void,
        },
        MethodSpec {
            name: "exitVoid",
            descriptor: "(Ljava/lang/String;Ljava/lang/String;)V",
            native: probe_exit_void as *mut c_void,
        },
        MethodSpec {
            name: "exitThrow",
            descriptor: "(Ljava/lang/Throwable;Ljava/lang/String;Ljava/lang/String;)V",
            native: probe_exit_throw as *mut c_void,
        },
    ]
}

/// Class bytes for `io/metracer/Probe`: a final synthetic class whose only
/// members are the four static native methods. No constructor is emitted;
/// nothing ever instantiates it.
pub fn probe_class_bytes() -> Result<Vec<u8>> {
    let mut pool = ConstantPool::new();
    let this_class = pool.ensure_class(PROBE_CLASS)?;
    let super_class = pool.ensure_class("java/lang/Object")?;

    let mut methods = Vec::new();
    for spec in probe_methods() {
        methods.push(MethodInfo {
            access_flags: ACC_PUBLIC | ACC_STATIC | ACC_NATIVE,
            name_index: pool.ensure_utf8(spec.name)?,
            descriptor_index: pool.ensure_utf8(spec.descriptor)?,
            attributes: Vec::new(),
        });
    }

    Ok(ClassFile {
        minor_version: 0,
        major_version: 52,
        constant_pool: pool,
        access_flags: ACC_PUBLIC | ACC_FINAL | ACC_SUPER | ACC_SYNTHETIC,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods,
        attributes: Vec::new(),
    }
    .write())
}

/// Define the probe class and bind its natives. Must run on an attached
/// thread before the first pattern is applied.
pub fn install_probe(jni: &JniEnv) -> Result<()> {
    let bytes = probe_class_bytes()?;
    let class = jni
        .define_class(PROBE_CLASS, &bytes)
        .context("defining probe class")?;

    let specs = probe_methods();
    let names: Vec<CString> = specs
        .iter()
        .map(|s| CString::new(s.name))
        .collect::<Result<_, _>>()
        .context("probe method name")?;
    let signatures: Vec<CString> = specs
        .iter()
        .map(|s| CString::new(s.descriptor))
        .collect::<Result<_, _>>()
        .context("probe method signature")?;
    let natives: Vec<JNINativeMethod> = specs
        .iter()
        .zip(names.iter().zip(signatures.iter()))
        .map(|(spec, (name, signature))| JNINativeMethod {
            name: name.as_ptr(),
            signature: signature.as_ptr(),
            fnPtr: spec.native,
        })
        .collect();
    jni.register_natives(class, &natives)
        .context("binding probe natives")?;

    ProbeRefs::init(jni).context("caching conversion classes")?;
    Ok(())
}

/// Global references and method ids the value converter needs, resolved once
/// at install time so the probe natives never run class lookup on a traced
/// thread.
struct ProbeRefs {
    string: jclass,
    boolean: jclass,
    character: jclass,
    integer_like: [jclass; 4],
    float_like: [jclass; 2],
    throwable: jclass,
    object_array: jclass,
    list: jclass,
    map: jclass,
    to_string: jmethodID,
    boolean_value: jmethodID,
    char_value: jmethodID,
    long_value: jmethodID,
    double_value: jmethodID,
    list_size: jmethodID,
    list_get: jmethodID,
    map_entry_set: jmethodID,
    collection_to_array: jmethodID,
    entry_get_key: jmethodID,
    entry_get_value: jmethodID,
}

// Holds only global references and method ids, both valid from any thread.
unsafe impl Send for ProbeRefs {}
unsafe impl Sync for ProbeRefs {}

static PROBE_REFS: OnceLock<ProbeRefs> = OnceLock::new();

impl ProbeRefs {
    fn init(jni: &JniEnv) -> Result<()> {
        let global_class = |name: &str| -> Result<jclass> {
            let local = jni.find_class(name)?;
            let global = jni.new_global_ref(local)?;
            jni.delete_local_ref(local);
            Ok(global)
        };

        let object = global_class("java/lang/Object")?;
        let number = global_class("java/lang/Number")?;
        let list = global_class("java/util/List")?;
        let map = global_class("java/util/Map")?;
        let entry = global_class("java/util/Map$Entry")?;
        let collection = global_class("java/util/Collection")?;
        let boolean = global_class("java/lang/Boolean")?;
        let character = global_class("java/lang/Character")?;

        let refs = ProbeRefs {
            string: global_class("java/lang/String")?,
            boolean,
            character,
            integer_like: [
                global_class("java/lang/Integer")?,
                global_class("java/lang/Long")?,
                global_class("java/lang/Short")?,
                global_class("java/lang/Byte")?,
            ],
            float_like: [
                global_class("java/lang/Float")?,
                global_class("java/lang/Double")?,
            ],
            throwable: global_class("java/lang/Throwable")?,
            object_array: global_class("[Ljava/lang/Object;")?,
            list,
            map,
            to_string: jni.get_method_id(object, "toString", "()Ljava/lang/String;")?,
            boolean_value: jni.get_method_id(boolean, "booleanValue", "()Z")?,
            char_value: jni.get_method_id(character, "charValue", "()C")?,
            long_value: jni.get_method_id(number, "longValue", "()J")?,
            double_value: jni.get_method_id(number, "doubleValue", "()D")?,
            list_size: jni.get_method_id(list, "size", "()I")?,
            list_get: jni.get_method_id(list, "get", "(I)Ljava/lang/Object;")?,
            map_entry_set: jni.get_method_id(map, "entrySet", "()Ljava/util/Set;")?,
            collection_to_array: jni.get_method_id(collection, "toArray", "()[Ljava/lang/Object;")?,
            entry_get_key: jni.get_method_id(entry, "getKey", "()Ljava/lang/Object;")?,
            entry_get_value: jni.get_method_id(entry, "getValue", "()Ljava/lang/Object;")?,
        };
        let _ = PROBE_REFS.set(refs);
        Ok(())
    }
}

/// Convert a `jobject` into a closed [`Value`]. Conversion failures inside a
/// branch degrade to `Other` or `Null`; this function must never raise back
/// into the traced thread.
fn to_value(jni: &JniEnv, obj: jobject, depth: u32) -> Value {
    if obj.is_null() {
        return Value::Null;
    }
    let Some(refs) = PROBE_REFS.get() else {
        return Value::Other("<uninitialized>".to_string());
    };

    if jni.is_instance_of(obj, refs.string) {
        return match jni.string_to_rust(obj) {
            Ok(s) => Value::Str(s),
            Err(_) => Value::Other("<string>".to_string()),
        };
    }
    if jni.is_instance_of(obj, refs.boolean) {
        return jni
            .call_boolean_method(obj, refs.boolean_value)
            .map(Value::Bool)
            .unwrap_or(Value::Null);
    }
    if jni.is_instance_of(obj, refs.character) {
        return jni
            .call_char_method(obj, refs.char_value)
            .ok()
            .and_then(|c| char::from_u32(c as u32))
            .map(Value::Char)
            .unwrap_or(Value::Null);
    }
    if refs.integer_like.iter().any(|c| jni.is_instance_of(obj, *c)) {
        return jni
            .call_long_method(obj, refs.long_value)
            .map(Value::Int)
            .unwrap_or(Value::Null);
    }
    if refs.float_like.iter().any(|c| jni.is_instance_of(obj, *c)) {
        return jni
            .call_double_method(obj, refs.double_value)
            .map(Value::Float)
            .unwrap_or(Value::Null);
    }
    if jni.is_instance_of(obj, refs.throwable) {
        return Value::Throwable(render_to_string(jni, obj));
    }

    if depth < MAX_CONVERSION_DEPTH {
        if jni.is_instance_of(obj, refs.object_array) {
            return convert_object_array(jni, obj, depth).unwrap_or(Value::Null);
        }
        if jni.is_instance_of(obj, refs.list) {
            return convert_list(jni, refs, obj, depth).unwrap_or(Value::Null);
        }
        if jni.is_instance_of(obj, refs.map) {
            return convert_map(jni, refs, obj, depth).unwrap_or(Value::Null);
        }
    }

    Value::Other(render_to_string(jni, obj))
}

fn render_to_string(jni: &JniEnv, obj: jobject) -> String {
    let Some(refs) = PROBE_REFS.get() else {
        return "<uninitialized>".to_string();
    };
    match jni.call_object_method(obj, refs.to_string) {
        Ok(s) if !s.is_null() => {
            let out = jni.string_to_rust(s).unwrap_or_else(|_| "<obj>".to_string());
            jni.delete_local_ref(s);
            out
        }
        _ => "<obj>".to_string(),
    }
}

fn convert_object_array(jni: &JniEnv, array: jobject, depth: u32) -> Result<Value> {
    let len = jni.array_length(array)?;
    let mut items = Vec::with_capacity(len.min(MAX_CONVERTED_ELEMENTS) as usize);
    for i in 0..len.min(MAX_CONVERTED_ELEMENTS) {
        let element = jni.object_array_element(array, i)?;
        items.push(to_value(jni, element, depth + 1));
        jni.delete_local_ref(element);
    }
    // Keeps the length signal for the ", ..." marker without converting the tail.
    for _ in MAX_CONVERTED_ELEMENTS..len {
        items.push(Value::Null);
    }
    Ok(Value::Array(items))
}

fn convert_list(jni: &JniEnv, refs: &ProbeRefs, list: jobject, depth: u32) -> Result<Value> {
    let len = jni.call_int_method(list, refs.list_size)?;
    let mut items = Vec::with_capacity(len.min(MAX_CONVERTED_ELEMENTS) as usize);
    for i in 0..len.min(MAX_CONVERTED_ELEMENTS) {
        let element =
            jni.call_object_method_1(list, refs.list_get, super::sys::jni::jvalue { i })?;
        items.push(to_value(jni, element, depth + 1));
        jni.delete_local_ref(element);
    }
    for _ in MAX_CONVERTED_ELEMENTS..len {
        items.push(Value::Null);
    }
    Ok(Value::List(items))
}

fn convert_map(jni: &JniEnv, refs: &ProbeRefs, map: jobject, depth: u32) -> Result<Value> {
    let entry_set = jni.call_object_method(map, refs.map_entry_set)?;
    let entries_array = jni.call_object_method(entry_set, refs.collection_to_array)?;
    jni.delete_local_ref(entry_set);

    let len = jni.array_length(entries_array)?;
    let mut entries = Vec::with_capacity(len.min(MAX_CONVERTED_ELEMENTS) as usize);
    for i in 0..len.min(MAX_CONVERTED_ELEMENTS) {
        let entry = jni.object_array_element(entries_array, i)?;
        let key = jni.call_object_method(entry, refs.entry_get_key)?;
        let value = jni.call_object_method(entry, refs.entry_get_value)?;
        entries.push((to_value(jni, key, depth + 1), to_value(jni, value, depth + 1)));
        jni.delete_local_ref(key);
        jni.delete_local_ref(value);
        jni.delete_local_ref(entry);
    }
    for _ in MAX_CONVERTED_ELEMENTS..len {
        entries.push((Value::Null, Value::Null));
    }
    jni.delete_local_ref(entries_array);
    Ok(Value::Map(entries))
}

fn required_string(jni: &JniEnv, s: jstring, fallback: &str) -> String {
    jni.string_to_rust(s).unwrap_or_else(|_| fallback.to_string())
}

unsafe extern "system" fn probe_enter(
    env: *mut JNIEnv,
    _class: jclass,
    class_name: jstring,
    method_name: jstring,
    arg_names: jobjectArray,
    arg_values: jobjectArray,
) {
    let jni = JniEnv::wrap(env);
    let Some(agent) = crate::Agent::get() else {
        return;
    };

    let class_name = required_string(&jni, class_name, "<class>");
    let method_name = required_string(&jni, method_name, "<method>");

    let mut args = Vec::new();
    if !arg_names.is_null() && !arg_values.is_null() {
        let count = jni.array_length(arg_values).unwrap_or(0);
        for i in 0..count {
            let name = match jni.object_array_element(arg_names, i) {
                Ok(n) if !n.is_null() => {
                    let out = required_string(&jni, n, UNKNOWN_ARG);
                    jni.delete_local_ref(n);
                    out
                }
                _ => UNKNOWN_ARG.to_string(),
            };
            let value = match jni.object_array_element(arg_values, i) {
                Ok(v) => {
                    let converted = to_value(&jni, v, 0);
                    jni.delete_local_ref(v);
                    converted
                }
                Err(e) => {
                    warn!("argument {} conversion failed: {}", i, e);
                    Value::Null
                }
            };
            args.push((name, value));
        }
    }

    agent.runtime().trace_entry(&class_name, &method_name, &args);
}

unsafe extern "system" fn probe_exit_return(
    env: *mut JNIEnv,
    _class: jclass,
    result: jobject,
    class_name: jstring,
    method_name: jstring,
) {
    let jni = JniEnv::wrap(env);
    let Some(agent) = crate::Agent::get() else {
        return;
    };
    let payload = to_value(&jni, result, 0);
    agent.runtime().trace_exit(
        &payload,
        &required_string(&jni, class_name, "<class>"),
        &required_string(&jni, method_name, "<method>"),
    );
}

unsafe extern "system" fn probe_exit_void(
    env: *mut JNIEnv,
    _class: jclass,
    class_name: jstring,
    method_name: jstring,
) {
    let jni = JniEnv::wrap(env);
    let Some(agent) = crate::Agent::get() else {
        return;
    };
    agent.runtime().trace_exit(
        &Value::Void,
        &required_string(&jni, class_name, "<class>"),
        &required_string(&jni, method_name, "<method>"),
    );
}

unsafe extern "system" fn probe_exit_throw(
    env: *mut JNIEnv,
    _class: jclass,
    thrown: jobject,
    class_name: jstring,
    method_name: jstring,
) {
    let jni = JniEnv::wrap(env);
    let Some(agent) = crate::Agent::get() else {
        return;
    };
    let payload = Value::Throwable(render_to_string(&jni, thrown));
    agent.runtime().trace_exit(
        &payload,
        &required_string(&jni, class_name, "<class>"),
        &required_string(&jni, method_name, "<method>"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use metracer_classfile::ClassFile;

    #[test]
    fn test_probe_class_declares_all_four_natives() {
        let bytes = probe_class_bytes().unwrap();
        let class = ClassFile::parse(&bytes).unwrap();
        assert_eq!(class.name().unwrap(), PROBE_CLASS);

        let names: Vec<String> = class
            .methods
            .iter()
            .map(|m| m.name(&class.constant_pool).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["enter", "exitReturn", "exitVoid", "exitThrow"]);
        for method in &class.methods {
            assert_ne!(method.access_flags & ACC_NATIVE, 0);
            assert_ne!(method.access_flags & ACC_STATIC, 0);
            assert!(method.attributes.is_empty(), "natives carry no Code");
        }
    }

    #[test]
    fn test_probe_descriptors_match_wrapper_call_sites() {
        let bytes = probe_class_bytes().unwrap();
        let class = ClassFile::parse(&bytes).unwrap();
        let descriptor_of = |name: &str| -> String {
            class
                .methods
                .iter()
                .find(|m| m.name(&class.constant_pool).unwrap() == name)
                .map(|m| m.descriptor(&class.constant_pool).unwrap().to_string())
                .unwrap()
        };
        assert_eq!(
            descriptor_of("enter"),
            "(Ljava/lang/String;Ljava/lang/String;[Ljava/lang/String;[Ljava/lang/Object;)V"
        );
        assert_eq!(
            descriptor_of("exitReturn"),
            "(Ljava/lang/Object;Ljava/lang/String;Ljava/lang/String;)V"
        );
        assert_eq!(descriptor_of("exitVoid"), "(Ljava/lang/String;Ljava/lang/String;)V");
        assert_eq!(
            descriptor_of("exitThrow"),
            "(Ljava/lang/Throwable;Ljava/lang/String;Ljava/lang/String;)V"
        );
    }
}
