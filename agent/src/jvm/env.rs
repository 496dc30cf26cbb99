//! Thin safe-ish wrappers over the raw JVMTI and JNI tables.
//!
//! Every call site dispatches through `Option` slots so a table from an
//! older VM fails with an error instead of a wild jump. Strings returned by
//! the VM are copied out and deallocated before the wrapper returns.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

use anyhow::{anyhow, bail, Context, Result};
use metracer_pattern::LoaderId;

use super::sys::jni::{
    jboolean, jclass, jint, jobject, jstring, jvalue, JNIEnv, JNINativeMethod, JavaVM, JNI_OK,
    JNI_TRUE, JNI_VERSION_1_8,
};
use super::sys::jvmti::{
    jvmtiCapabilities, jvmtiClassFileLoadHookFn, jvmtiEnv, jvmtiError, jvmtiEventCallbacks,
    JVMTI_ENABLE, JVMTI_ERROR_NONE, JVMTI_EVENT_CLASS_FILE_LOAD_HOOK, JVMTI_VERSION_1_2,
};

/// Handle to the VM-wide JVMTI environment.
///
/// JVMTI environments are valid from any attached thread, so the handle is
/// shared freely across the agent's threads.
#[derive(Clone, Copy)]
pub struct JvmtiEnv {
    raw: *mut jvmtiEnv,
}

unsafe impl Send for JvmtiEnv {}
unsafe impl Sync for JvmtiEnv {}

impl JvmtiEnv {
    /// Obtain the JVMTI environment from the VM.
    pub fn from_vm(vm: *mut JavaVM) -> Result<Self> {
        let mut env: *mut c_void = std::ptr::null_mut();
        let get_env = unsafe { (**vm).GetEnv }.ok_or_else(|| anyhow!("JavaVM has no GetEnv"))?;
        let rc = unsafe { get_env(vm, &mut env, JVMTI_VERSION_1_2) };
        if rc != JNI_OK || env.is_null() {
            bail!("GetEnv(JVMTI_VERSION_1_2) failed with {}", rc);
        }
        Ok(Self {
            raw: env as *mut jvmtiEnv,
        })
    }

    /// Wrap an environment pointer the VM already handed out (event
    /// callbacks receive one as their first argument).
    pub fn from_raw(raw: *mut jvmtiEnv) -> Self {
        Self { raw }
    }

    fn table(&self) -> &'static super::sys::jvmti::jvmtiInterface_1_ {
        unsafe { &*(*self.raw).functions }
    }

    fn check(&self, what: &str, rc: jvmtiError) -> Result<()> {
        if rc == JVMTI_ERROR_NONE {
            Ok(())
        } else {
            Err(anyhow!("{} failed with jvmtiError {}", what, rc))
        }
    }

    /// Request the capabilities class retransformation needs. Must be called
    /// during `Agent_OnAttach`, before any retransform.
    pub fn add_retransform_capabilities(&self) -> Result<()> {
        let mut caps = jvmtiCapabilities::default();
        caps.set_can_retransform_classes();
        caps.set_can_retransform_any_class();
        caps.set_can_generate_all_class_hook_events();
        let f = self
            .table()
            .AddCapabilities
            .ok_or_else(|| anyhow!("AddCapabilities missing"))?;
        self.check("AddCapabilities", unsafe { f(self.raw, &caps) })
    }

    /// Install `hook` as the ClassFileLoadHook callback and enable the event
    /// globally.
    pub fn enable_class_file_load_hook(&self, hook: jvmtiClassFileLoadHookFn) -> Result<()> {
        let callbacks = jvmtiEventCallbacks {
            ClassFileLoadHook: Some(hook),
            ..Default::default()
        };
        let set_callbacks = self
            .table()
            .SetEventCallbacks
            .ok_or_else(|| anyhow!("SetEventCallbacks missing"))?;
        self.check("SetEventCallbacks", unsafe {
            set_callbacks(
                self.raw,
                &callbacks,
                std::mem::size_of::<jvmtiEventCallbacks>() as jint,
            )
        })?;

        let set_mode = self
            .table()
            .SetEventNotificationMode
            .ok_or_else(|| anyhow!("SetEventNotificationMode missing"))?;
        self.check("SetEventNotificationMode", unsafe {
            set_mode(
                self.raw,
                JVMTI_ENABLE,
                JVMTI_EVENT_CLASS_FILE_LOAD_HOOK,
                std::ptr::null_mut(),
            )
        })
    }

    /// All currently loaded classes as local references. The caller owns the
    /// references; the backing array is deallocated here.
    pub fn loaded_classes(&self) -> Result<Vec<jclass>> {
        let f = self
            .table()
            .GetLoadedClasses
            .ok_or_else(|| anyhow!("GetLoadedClasses missing"))?;
        let mut count: jint = 0;
        let mut classes: *mut jclass = std::ptr::null_mut();
        self.check("GetLoadedClasses", unsafe {
            f(self.raw, &mut count, &mut classes)
        })?;
        let out = unsafe { std::slice::from_raw_parts(classes, count as usize).to_vec() };
        self.deallocate(classes as *mut u8);
        Ok(out)
    }

    pub fn is_modifiable(&self, class: jclass) -> bool {
        let Some(f) = self.table().IsModifiableClass else {
            return false;
        };
        let mut modifiable: jboolean = 0;
        let rc = unsafe { f(self.raw, class, &mut modifiable) };
        rc == JVMTI_ERROR_NONE && modifiable == JNI_TRUE
    }

    /// Dotted class name, e.g. `com.app.Worker`. Returns `None` for array
    /// and primitive signatures.
    pub fn class_name(&self, class: jclass) -> Result<Option<String>> {
        let f = self
            .table()
            .GetClassSignature
            .ok_or_else(|| anyhow!("GetClassSignature missing"))?;
        let mut signature: *mut c_char = std::ptr::null_mut();
        let mut generic: *mut c_char = std::ptr::null_mut();
        self.check("GetClassSignature", unsafe {
            f(self.raw, class, &mut signature, &mut generic)
        })?;
        let text = unsafe { CStr::from_ptr(signature) }
            .to_string_lossy()
            .into_owned();
        self.deallocate(signature as *mut u8);
        if !generic.is_null() {
            self.deallocate(generic as *mut u8);
        }

        // Only plain object signatures name retransformable classes.
        let Some(inner) = text.strip_prefix('L').and_then(|s| s.strip_suffix(';')) else {
            return Ok(None);
        };
        Ok(Some(inner.replace('/', ".")))
    }

    /// Identity of a loader reference, derived from its identity hash.
    /// The bootstrap loader (null reference) maps to `LoaderId(0)`.
    pub fn object_loader_id(&self, loader: jobject) -> Result<LoaderId> {
        if loader.is_null() {
            return Ok(LoaderId(0));
        }
        let hash = self
            .table()
            .GetObjectHashCode
            .ok_or_else(|| anyhow!("GetObjectHashCode missing"))?;
        let mut code: jint = 0;
        self.check("GetObjectHashCode", unsafe { hash(self.raw, loader, &mut code) })?;
        Ok(LoaderId(code as i64))
    }

    /// Retransform a single class. One class per call keeps failures
    /// isolated; a bad class never takes down the rest of the batch.
    pub fn retransform_one(&self, class: jclass) -> Result<()> {
        let f = self
            .table()
            .RetransformClasses
            .ok_or_else(|| anyhow!("RetransformClasses missing"))?;
        self.check("RetransformClasses", unsafe { f(self.raw, 1, &class) })
    }

    /// Copy `bytes` into JVMTI-allocated memory. Required for class data
    /// returned from the load hook; the VM deallocates it.
    pub fn allocate_copy(&self, bytes: &[u8]) -> Result<*mut u8> {
        let f = self
            .table()
            .Allocate
            .ok_or_else(|| anyhow!("Allocate missing"))?;
        let mut mem: *mut u8 = std::ptr::null_mut();
        self.check("Allocate", unsafe {
            f(self.raw, bytes.len() as i64, &mut mem)
        })?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), mem, bytes.len()) };
        Ok(mem)
    }

    fn deallocate(&self, mem: *mut u8) {
        if let Some(f) = self.table().Deallocate {
            unsafe { f(self.raw, mem) };
        }
    }
}

/// Per-thread JNI environment. Never send this across threads; fetch a fresh
/// one via [`attach_current_thread`] instead.
#[derive(Clone, Copy)]
pub struct JniEnv {
    raw: *mut JNIEnv,
}

impl JniEnv {
    /// # Safety
    /// `raw` must be a valid `JNIEnv*` for the current thread.
    pub unsafe fn wrap(raw: *mut JNIEnv) -> Self {
        Self { raw }
    }

    fn table(&self) -> &'static super::sys::jni::JNINativeInterface_ {
        unsafe { &**self.raw }
    }

    pub fn define_class(&self, name: &str, bytes: &[u8]) -> Result<jclass> {
        let cname = CString::new(name).context("class name contains NUL")?;
        let f = self
            .table()
            .DefineClass
            .ok_or_else(|| anyhow!("DefineClass missing"))?;
        let class = unsafe {
            f(
                self.raw,
                cname.as_ptr(),
                std::ptr::null_mut(),
                bytes.as_ptr() as *const i8,
                bytes.len() as jint,
            )
        };
        if class.is_null() || self.exception_check() {
            self.exception_clear();
            bail!("DefineClass({}) failed", name);
        }
        Ok(class)
    }

    pub fn find_class(&self, name: &str) -> Result<jclass> {
        let cname = CString::new(name).context("class name contains NUL")?;
        let f = self
            .table()
            .FindClass
            .ok_or_else(|| anyhow!("FindClass missing"))?;
        let class = unsafe { f(self.raw, cname.as_ptr()) };
        if class.is_null() || self.exception_check() {
            self.exception_clear();
            bail!("FindClass({}) failed", name);
        }
        Ok(class)
    }

    pub fn new_global_ref(&self, obj: jobject) -> Result<jobject> {
        let f = self
            .table()
            .NewGlobalRef
            .ok_or_else(|| anyhow!("NewGlobalRef missing"))?;
        let global = unsafe { f(self.raw, obj) };
        if global.is_null() {
            bail!("NewGlobalRef returned null");
        }
        Ok(global)
    }

    pub fn delete_local_ref(&self, obj: jobject) {
        if let Some(f) = self.table().DeleteLocalRef {
            unsafe { f(self.raw, obj) };
        }
    }

    pub fn get_method_id(&self, class: jclass, name: &str, signature: &str) -> Result<super::sys::jni::jmethodID> {
        let cname = CString::new(name).context("method name contains NUL")?;
        let csig = CString::new(signature).context("signature contains NUL")?;
        let f = self
            .table()
            .GetMethodID
            .ok_or_else(|| anyhow!("GetMethodID missing"))?;
        let id = unsafe { f(self.raw, class, cname.as_ptr(), csig.as_ptr()) };
        if id.is_null() || self.exception_check() {
            self.exception_clear();
            bail!("GetMethodID({}{}) failed", name, signature);
        }
        Ok(id)
    }

    pub fn register_natives(&self, class: jclass, methods: &[JNINativeMethod]) -> Result<()> {
        let f = self
            .table()
            .RegisterNatives
            .ok_or_else(|| anyhow!("RegisterNatives missing"))?;
        let rc = unsafe { f(self.raw, class, methods.as_ptr(), methods.len() as jint) };
        if rc != JNI_OK {
            bail!("RegisterNatives failed with {}", rc);
        }
        Ok(())
    }

    pub fn is_instance_of(&self, obj: jobject, class: jclass) -> bool {
        match self.table().IsInstanceOf {
            Some(f) => (unsafe { f(self.raw, obj, class) } == JNI_TRUE),
            None => false,
        }
    }

    pub fn call_object_method(&self, obj: jobject, method: super::sys::jni::jmethodID) -> Result<jobject> {
        let f = self
            .table()
            .CallObjectMethodA
            .ok_or_else(|| anyhow!("CallObjectMethodA missing"))?;
        let out = unsafe { f(self.raw, obj, method, std::ptr::null()) };
        if self.exception_check() {
            self.exception_clear();
            bail!("object-returning call raised");
        }
        Ok(out)
    }

    pub fn call_long_method(&self, obj: jobject, method: super::sys::jni::jmethodID) -> Result<i64> {
        let f = self
            .table()
            .CallLongMethodA
            .ok_or_else(|| anyhow!("CallLongMethodA missing"))?;
        let out = unsafe { f(self.raw, obj, method, std::ptr::null()) };
        if self.exception_check() {
            self.exception_clear();
            bail!("long-returning call raised");
        }
        Ok(out)
    }

    pub fn call_double_method(&self, obj: jobject, method: super::sys::jni::jmethodID) -> Result<f64> {
        let f = self
            .table()
            .CallDoubleMethodA
            .ok_or_else(|| anyhow!("CallDoubleMethodA missing"))?;
        let out = unsafe { f(self.raw, obj, method, std::ptr::null()) };
        if self.exception_check() {
            self.exception_clear();
            bail!("double-returning call raised");
        }
        Ok(out)
    }

    pub fn call_boolean_method(&self, obj: jobject, method: super::sys::jni::jmethodID) -> Result<bool> {
        let f = self
            .table()
            .CallBooleanMethodA
            .ok_or_else(|| anyhow!("CallBooleanMethodA missing"))?;
        let out = unsafe { f(self.raw, obj, method, std::ptr::null()) };
        if self.exception_check() {
            self.exception_clear();
            bail!("boolean-returning call raised");
        }
        Ok(out == JNI_TRUE)
    }

    pub fn call_char_method(&self, obj: jobject, method: super::sys::jni::jmethodID) -> Result<u16> {
        let f = self
            .table()
            .CallCharMethodA
            .ok_or_else(|| anyhow!("CallCharMethodA missing"))?;
        let out = unsafe { f(self.raw, obj, method, std::ptr::null()) };
        if self.exception_check() {
            self.exception_clear();
            bail!("char-returning call raised");
        }
        Ok(out)
    }

    pub fn call_int_method(&self, obj: jobject, method: super::sys::jni::jmethodID) -> Result<i32> {
        let f = self
            .table()
            .CallIntMethodA
            .ok_or_else(|| anyhow!("CallIntMethodA missing"))?;
        let out = unsafe { f(self.raw, obj, method, std::ptr::null()) };
        if self.exception_check() {
            self.exception_clear();
            bail!("int-returning call raised");
        }
        Ok(out)
    }

    pub fn call_object_method_1(
        &self,
        obj: jobject,
        method: super::sys::jni::jmethodID,
        arg: jvalue,
    ) -> Result<jobject> {
        let f = self
            .table()
            .CallObjectMethodA
            .ok_or_else(|| anyhow!("CallObjectMethodA missing"))?;
        let out = unsafe { f(self.raw, obj, method, &arg) };
        if self.exception_check() {
            self.exception_clear();
            bail!("object-returning call raised");
        }
        Ok(out)
    }

    /// Copy a `jstring` out as UTF-8.
    pub fn string_to_rust(&self, s: jstring) -> Result<String> {
        if s.is_null() {
            bail!("null string reference");
        }
        let get = self
            .table()
            .GetStringUTFChars
            .ok_or_else(|| anyhow!("GetStringUTFChars missing"))?;
        let release = self
            .table()
            .ReleaseStringUTFChars
            .ok_or_else(|| anyhow!("ReleaseStringUTFChars missing"))?;
        let chars = unsafe { get(self.raw, s, std::ptr::null_mut()) };
        if chars.is_null() {
            bail!("GetStringUTFChars returned null");
        }
        let out = unsafe { CStr::from_ptr(chars) }.to_string_lossy().into_owned();
        unsafe { release(self.raw, s, chars) };
        Ok(out)
    }

    pub fn array_length(&self, array: jobject) -> Result<i32> {
        let f = self
            .table()
            .GetArrayLength
            .ok_or_else(|| anyhow!("GetArrayLength missing"))?;
        Ok(unsafe { f(self.raw, array) })
    }

    pub fn object_array_element(&self, array: jobject, index: i32) -> Result<jobject> {
        let f = self
            .table()
            .GetObjectArrayElement
            .ok_or_else(|| anyhow!("GetObjectArrayElement missing"))?;
        let out = unsafe { f(self.raw, array, index) };
        if self.exception_check() {
            self.exception_clear();
            bail!("GetObjectArrayElement({}) raised", index);
        }
        Ok(out)
    }

    pub fn exception_check(&self) -> bool {
        match self.table().ExceptionCheck {
            Some(f) => (unsafe { f(self.raw) } == JNI_TRUE),
            None => false,
        }
    }

    pub fn exception_clear(&self) {
        if let Some(f) = self.table().ExceptionClear {
            unsafe { f(self.raw) };
        }
    }
}

/// Attach the calling thread to the VM as a daemon and return its JNI
/// environment. Idempotent for already-attached threads.
pub fn attach_current_thread(vm: *mut JavaVM) -> Result<JniEnv> {
    let mut env: *mut c_void = std::ptr::null_mut();

    let get_env = unsafe { (**vm).GetEnv }.ok_or_else(|| anyhow!("JavaVM has no GetEnv"))?;
    if unsafe { get_env(vm, &mut env, JNI_VERSION_1_8) } == JNI_OK && !env.is_null() {
        return Ok(unsafe { JniEnv::wrap(env as *mut JNIEnv) });
    }

    let attach = unsafe { (**vm).AttachCurrentThreadAsDaemon }
        .ok_or_else(|| anyhow!("JavaVM has no AttachCurrentThreadAsDaemon"))?;
    let rc = unsafe { attach(vm, &mut env, std::ptr::null_mut()) };
    if rc != JNI_OK || env.is_null() {
        bail!("AttachCurrentThreadAsDaemon failed with {}", rc);
    }
    Ok(unsafe { JniEnv::wrap(env as *mut JNIEnv) })
}
