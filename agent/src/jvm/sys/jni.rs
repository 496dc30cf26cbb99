//! Minimal hand-written JNI bindings.
//!
//! Only the slots the agent actually calls are named; everything between is
//! reserved padding so the named fields land at the offsets mandated by
//! `jni.h`. The tables are only ever read through pointers handed out by the
//! JVM, never constructed here.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]

use std::os::raw::{c_char, c_void};

pub type jint = i32;
pub type jlong = i64;
pub type jbyte = i8;
pub type jboolean = u8;
pub type jchar = u16;
pub type jshort = i16;
pub type jfloat = f32;
pub type jdouble = f64;
pub type jsize = jint;

pub type jobject = *mut c_void;
pub type jclass = jobject;
pub type jstring = jobject;
pub type jarray = jobject;
pub type jobjectArray = jarray;
pub type jthrowable = jobject;
pub type jmethodID = *mut c_void;

pub const JNI_OK: jint = 0;
pub const JNI_TRUE: jboolean = 1;
pub const JNI_FALSE: jboolean = 0;
pub const JNI_VERSION_1_8: jint = 0x0001_0008;

#[repr(C)]
#[derive(Copy, Clone)]
pub union jvalue {
    pub z: jboolean,
    pub b: jbyte,
    pub c: jchar,
    pub s: jshort,
    pub i: jint,
    pub j: jlong,
    pub f: jfloat,
    pub d: jdouble,
    pub l: jobject,
}

#[repr(C)]
pub struct JNINativeMethod {
    pub name: *const c_char,
    pub signature: *const c_char,
    pub fnPtr: *mut c_void,
}

pub type DefineClassFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    name: *const c_char,
    loader: jobject,
    buf: *const jbyte,
    len: jsize,
) -> jclass;
pub type FindClassFn =
    unsafe extern "system" fn(env: *mut JNIEnv, name: *const c_char) -> jclass;
pub type ExceptionOccurredFn = unsafe extern "system" fn(env: *mut JNIEnv) -> jthrowable;
pub type ExceptionDescribeFn = unsafe extern "system" fn(env: *mut JNIEnv);
pub type ExceptionClearFn = unsafe extern "system" fn(env: *mut JNIEnv);
pub type NewGlobalRefFn = unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject) -> jobject;
pub type DeleteGlobalRefFn = unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject);
pub type DeleteLocalRefFn = unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject);
pub type IsSameObjectFn =
    unsafe extern "system" fn(env: *mut JNIEnv, a: jobject, b: jobject) -> jboolean;
pub type GetObjectClassFn = unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject) -> jclass;
pub type IsInstanceOfFn =
    unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject, class: jclass) -> jboolean;
pub type GetMethodIDFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    class: jclass,
    name: *const c_char,
    signature: *const c_char,
) -> jmethodID;
pub type CallObjectMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    obj: jobject,
    method: jmethodID,
    args: *const jvalue,
) -> jobject;
pub type CallBooleanMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    obj: jobject,
    method: jmethodID,
    args: *const jvalue,
) -> jboolean;
pub type CallByteMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    obj: jobject,
    method: jmethodID,
    args: *const jvalue,
) -> jbyte;
pub type CallCharMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    obj: jobject,
    method: jmethodID,
    args: *const jvalue,
) -> jchar;
pub type CallShortMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    obj: jobject,
    method: jmethodID,
    args: *const jvalue,
) -> jshort;
pub type CallIntMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    obj: jobject,
    method: jmethodID,
    args: *const jvalue,
) -> jint;
pub type CallLongMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    obj: jobject,
    method: jmethodID,
    args: *const jvalue,
) -> jlong;
pub type CallFloatMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    obj: jobject,
    method: jmethodID,
    args: *const jvalue,
) -> jfloat;
pub type CallDoubleMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    obj: jobject,
    method: jmethodID,
    args: *const jvalue,
) -> jdouble;
pub type CallVoidMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    obj: jobject,
    method: jmethodID,
    args: *const jvalue,
);
pub type GetStaticMethodIDFn = GetMethodIDFn;
pub type CallStaticObjectMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    class: jclass,
    method: jmethodID,
    args: *const jvalue,
) -> jobject;
pub type CallStaticVoidMethodAFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    class: jclass,
    method: jmethodID,
    args: *const jvalue,
);
pub type NewStringUTFFn =
    unsafe extern "system" fn(env: *mut JNIEnv, utf: *const c_char) -> jstring;
pub type GetStringUTFLengthFn =
    unsafe extern "system" fn(env: *mut JNIEnv, string: jstring) -> jsize;
pub type GetStringUTFCharsFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    string: jstring,
    is_copy: *mut jboolean,
) -> *const c_char;
pub type ReleaseStringUTFCharsFn =
    unsafe extern "system" fn(env: *mut JNIEnv, string: jstring, utf: *const c_char);
pub type GetArrayLengthFn = unsafe extern "system" fn(env: *mut JNIEnv, array: jarray) -> jsize;
pub type GetObjectArrayElementFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    array: jobjectArray,
    index: jsize,
) -> jobject;
pub type SetObjectArrayElementFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    array: jobjectArray,
    index: jsize,
    value: jobject,
);
pub type RegisterNativesFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    class: jclass,
    methods: *const JNINativeMethod,
    count: jint,
) -> jint;
pub type GetJavaVMFn =
    unsafe extern "system" fn(env: *mut JNIEnv, vm: *mut *mut JavaVM) -> jint;
pub type ExceptionCheckFn = unsafe extern "system" fn(env: *mut JNIEnv) -> jboolean;

/// `JNINativeInterface_` with only the used slots named. Slot numbers in the
/// comments are the indices from `jni.h`.
#[repr(C)]
pub struct JNINativeInterface_ {
    pub reserved: [*mut c_void; 4],                    // 0-3
    pub GetVersion: *mut c_void,                       // 4
    pub DefineClass: Option<DefineClassFn>,            // 5
    pub FindClass: Option<FindClassFn>,                // 6
    _pad07_14: [*mut c_void; 8],                       // 7-14
    pub ExceptionOccurred: Option<ExceptionOccurredFn>, // 15
    pub ExceptionDescribe: Option<ExceptionDescribeFn>, // 16
    pub ExceptionClear: Option<ExceptionClearFn>,      // 17
    _pad18_20: [*mut c_void; 3],                       // 18-20
    pub NewGlobalRef: Option<NewGlobalRefFn>,          // 21
    pub DeleteGlobalRef: Option<DeleteGlobalRefFn>,    // 22
    pub DeleteLocalRef: Option<DeleteLocalRefFn>,      // 23
    pub IsSameObject: Option<IsSameObjectFn>,          // 24
    _pad25_30: [*mut c_void; 6],                       // 25-30
    pub GetObjectClass: Option<GetObjectClassFn>,      // 31
    pub IsInstanceOf: Option<IsInstanceOfFn>,          // 32
    pub GetMethodID: Option<GetMethodIDFn>,            // 33
    _pad34_35: [*mut c_void; 2],                       // 34-35
    pub CallObjectMethodA: Option<CallObjectMethodAFn>, // 36
    _pad37_38: [*mut c_void; 2],                       // 37-38
    pub CallBooleanMethodA: Option<CallBooleanMethodAFn>, // 39
    _pad40_41: [*mut c_void; 2],                       // 40-41
    pub CallByteMethodA: Option<CallByteMethodAFn>,    // 42
    _pad43_44: [*mut c_void; 2],                       // 43-44
    pub CallCharMethodA: Option<CallCharMethodAFn>,    // 45
    _pad46_47: [*mut c_void; 2],                       // 46-47
    pub CallShortMethodA: Option<CallShortMethodAFn>,  // 48
    _pad49_50: [*mut c_void; 2],                       // 49-50
    pub CallIntMethodA: Option<CallIntMethodAFn>,      // 51
    _pad52_53: [*mut c_void; 2],                       // 52-53
    pub CallLongMethodA: Option<CallLongMethodAFn>,    // 54
    _pad55_56: [*mut c_void; 2],                       // 55-56
    pub CallFloatMethodA: Option<CallFloatMethodAFn>,  // 57
    _pad58_59: [*mut c_void; 2],                       // 58-59
    pub CallDoubleMethodA: Option<CallDoubleMethodAFn>, // 60
    _pad61_62: [*mut c_void; 2],                       // 61-62
    pub CallVoidMethodA: Option<CallVoidMethodAFn>,    // 63
    _pad64_93: [*mut c_void; 30],                      // 64-93 (nonvirtual calls)
    pub GetFieldID: *mut c_void,                       // 94
    _pad95_112: [*mut c_void; 18],                     // 95-112 (field accessors)
    pub GetStaticMethodID: Option<GetStaticMethodIDFn>, // 113
    _pad114_115: [*mut c_void; 2],                     // 114-115
    pub CallStaticObjectMethodA: Option<CallStaticObjectMethodAFn>, // 116
    _pad117_142: [*mut c_void; 26],                    // 117-142 (static calls)
    pub CallStaticVoidMethodA: Option<CallStaticVoidMethodAFn>, // 143
    _pad144_166: [*mut c_void; 23],                    // 144-166 (static fields, jchar strings)
    pub NewStringUTF: Option<NewStringUTFFn>,          // 167
    pub GetStringUTFLength: Option<GetStringUTFLengthFn>, // 168
    pub GetStringUTFChars: Option<GetStringUTFCharsFn>, // 169
    pub ReleaseStringUTFChars: Option<ReleaseStringUTFCharsFn>, // 170
    pub GetArrayLength: Option<GetArrayLengthFn>,      // 171
    _pad172: [*mut c_void; 1],                         // 172
    pub GetObjectArrayElement: Option<GetObjectArrayElementFn>, // 173
    pub SetObjectArrayElement: Option<SetObjectArrayElementFn>, // 174
    _pad175_214: [*mut c_void; 40],                    // 175-214 (primitive arrays)
    pub RegisterNatives: Option<RegisterNativesFn>,    // 215
    pub UnregisterNatives: *mut c_void,                // 216
    _pad217_218: [*mut c_void; 2],                     // 217-218 (monitors)
    pub GetJavaVM: Option<GetJavaVMFn>,                // 219
    _pad220_227: [*mut c_void; 8],                     // 220-227
    pub ExceptionCheck: Option<ExceptionCheckFn>,      // 228
}

pub type JNIEnv = *const JNINativeInterface_;

pub type AttachCurrentThreadAsDaemonFn = unsafe extern "system" fn(
    vm: *mut JavaVM,
    penv: *mut *mut c_void,
    args: *mut c_void,
) -> jint;
pub type DetachCurrentThreadFn = unsafe extern "system" fn(vm: *mut JavaVM) -> jint;
pub type GetEnvFn = unsafe extern "system" fn(
    vm: *mut JavaVM,
    penv: *mut *mut c_void,
    version: jint,
) -> jint;

#[repr(C)]
pub struct JNIInvokeInterface_ {
    pub reserved: [*mut c_void; 3],
    pub DestroyJavaVM: *mut c_void,
    pub AttachCurrentThread: *mut c_void,
    pub DetachCurrentThread: Option<DetachCurrentThreadFn>,
    pub GetEnv: Option<GetEnvFn>,
    pub AttachCurrentThreadAsDaemon: Option<AttachCurrentThreadAsDaemonFn>,
}

pub type JavaVM = *const JNIInvokeInterface_;
