//! Minimal hand-written JVMTI bindings.
//!
//! Same approach as [`super::jni`]: only the slots the agent dispatches
//! through are named, with reserved padding keeping the offsets in line with
//! `jvmti.h`. Slot numbers in the comments are the 1-based function numbers
//! from the JVMTI specification.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::os::raw::{c_char, c_uchar, c_void};

use super::jni::{jclass, jint, jobject, JNIEnv};

pub type jvmtiError = jint;

pub const JVMTI_ERROR_NONE: jvmtiError = 0;

pub const JVMTI_VERSION_1_2: jint = 0x3001_0200;

pub const JVMTI_ENABLE: jint = 1;
pub const JVMTI_DISABLE: jint = 0;

pub const JVMTI_EVENT_CLASS_FILE_LOAD_HOOK: jint = 54;

/// `jvmtiCapabilities` is a 128-bit little-endian bitfield in C. Individual
/// capabilities are addressed by bit position within `[u32; 4]`.
#[repr(C)]
#[derive(Default)]
pub struct jvmtiCapabilities {
    bits: [u32; 4],
}

impl jvmtiCapabilities {
    fn set(&mut self, bit: usize) {
        self.bits[bit / 32] |= 1 << (bit % 32);
    }

    pub fn set_can_generate_all_class_hook_events(&mut self) {
        self.set(26);
    }

    pub fn set_can_retransform_classes(&mut self) {
        self.set(37);
    }

    pub fn set_can_retransform_any_class(&mut self) {
        self.set(38);
    }
}

pub type jvmtiClassFileLoadHookFn = unsafe extern "system" fn(
    jvmti_env: *mut jvmtiEnv,
    jni_env: *mut JNIEnv,
    class_being_redefined: jclass,
    loader: jobject,
    name: *const c_char,
    protection_domain: jobject,
    class_data_len: jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut c_uchar,
);

/// `jvmtiEventCallbacks` truncated after the last callback the agent
/// installs. `SetEventCallbacks` copies `size_of_callbacks` bytes, so the
/// tail of the full C struct can be omitted.
#[repr(C)]
#[derive(Default)]
pub struct jvmtiEventCallbacks {
    pub VMInit: Option<unsafe extern "system" fn(*mut jvmtiEnv, *mut JNIEnv, jobject)>,
    pub VMDeath: Option<unsafe extern "system" fn(*mut jvmtiEnv, *mut JNIEnv)>,
    pub ThreadStart: Option<unsafe extern "system" fn(*mut jvmtiEnv, *mut JNIEnv, jobject)>,
    pub ThreadEnd: Option<unsafe extern "system" fn(*mut jvmtiEnv, *mut JNIEnv, jobject)>,
    pub ClassFileLoadHook: Option<jvmtiClassFileLoadHookFn>,
}

// Variadic in C, but the trailing arguments are reserved for future use and
// never passed, so a fixed-arity pointer type is sufficient.
pub type SetEventNotificationModeFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    mode: jint,
    event_type: jint,
    event_thread: jobject,
) -> jvmtiError;
pub type IsModifiableClassFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    class: jclass,
    is_modifiable: *mut super::jni::jboolean,
) -> jvmtiError;
pub type AllocateFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    size: super::jni::jlong,
    mem: *mut *mut c_uchar,
) -> jvmtiError;
pub type DeallocateFn =
    unsafe extern "system" fn(env: *mut jvmtiEnv, mem: *mut c_uchar) -> jvmtiError;
pub type GetClassSignatureFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    class: jclass,
    signature: *mut *mut c_char,
    generic: *mut *mut c_char,
) -> jvmtiError;
pub type GetClassLoaderFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    class: jclass,
    loader: *mut jobject,
) -> jvmtiError;
pub type GetObjectHashCodeFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    object: jobject,
    hash_code: *mut jint,
) -> jvmtiError;
pub type GetLoadedClassesFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    class_count: *mut jint,
    classes: *mut *mut jclass,
) -> jvmtiError;
pub type SetEventCallbacksFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    callbacks: *const jvmtiEventCallbacks,
    size_of_callbacks: jint,
) -> jvmtiError;
pub type AddCapabilitiesFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    capabilities: *const jvmtiCapabilities,
) -> jvmtiError;
pub type RetransformClassesFn = unsafe extern "system" fn(
    env: *mut jvmtiEnv,
    class_count: jint,
    classes: *const jclass,
) -> jvmtiError;

#[repr(C)]
pub struct jvmtiInterface_1_ {
    pub reserved1: *mut c_void,                                   // 1
    pub SetEventNotificationMode: Option<SetEventNotificationModeFn>, // 2
    _pad003_044: [*mut c_void; 42],                               // 3-44
    pub IsModifiableClass: Option<IsModifiableClassFn>,           // 45
    pub Allocate: Option<AllocateFn>,                             // 46
    pub Deallocate: Option<DeallocateFn>,                         // 47
    pub GetClassSignature: Option<GetClassSignatureFn>,           // 48
    _pad049_056: [*mut c_void; 8],                                // 49-56
    pub GetClassLoader: Option<GetClassLoaderFn>,                 // 57
    pub GetObjectHashCode: Option<GetObjectHashCodeFn>,           // 58
    _pad059_077: [*mut c_void; 19],                               // 59-77
    pub GetLoadedClasses: Option<GetLoadedClassesFn>,             // 78
    _pad079_121: [*mut c_void; 43],                               // 79-121
    pub SetEventCallbacks: Option<SetEventCallbacksFn>,           // 122
    _pad123_141: [*mut c_void; 19],                               // 123-141
    pub AddCapabilities: Option<AddCapabilitiesFn>,               // 142
    _pad143_151: [*mut c_void; 9],                                // 143-151
    pub RetransformClasses: Option<RetransformClassesFn>,         // 152
}

#[repr(C)]
pub struct jvmtiEnv {
    pub functions: *const jvmtiInterface_1_,
}
