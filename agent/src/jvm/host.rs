//! JVMTI-backed [`ClassHost`] and the class-file load hook.
//!
//! The load hook is a process-global callback, so the active pattern set
//! lives in a process-global slot. The hook reads it on every class load or
//! retransform: with a set installed it rewrites matching classes, with
//! `None` it leaves the VM-supplied pristine bytes alone, which is exactly
//! how deinstrumentation restores a class.

use std::collections::{HashMap, HashSet};
use std::ffi::CStr;
use std::os::raw::{c_char, c_uchar};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};
use metracer_pattern::PatternSet;

use crate::session::{ClassHost, RetransformReport};
use crate::transform::transform;

use super::env::JvmtiEnv;
use super::sys::jni::{jclass, jint, jobject, JNIEnv};
use super::sys::jvmti::jvmtiEnv;

static ACTIVE_PATTERNS: RwLock<Option<Arc<PatternSet>>> = RwLock::new(None);

/// Classes the hook failed to rewrite during the current retransform batch.
static HOOK_FAILURES: Mutex<Vec<String>> = Mutex::new(Vec::new());

pub struct JvmClassHost {
    jvmti: JvmtiEnv,
}

impl JvmClassHost {
    pub fn new(jvmti: JvmtiEnv) -> Self {
        Self { jvmti }
    }

    /// Dotted name to class reference for every modifiable loaded class.
    /// When several loaders define the same name the hook still rewrites
    /// each definition; only the reference map collapses duplicates.
    fn modifiable_classes(&self) -> HashMap<String, Vec<jclass>> {
        let mut out: HashMap<String, Vec<jclass>> = HashMap::new();
        let classes = match self.jvmti.loaded_classes() {
            Ok(c) => c,
            Err(e) => {
                warn!("enumerating loaded classes failed: {}", e);
                return out;
            }
        };
        for class in classes {
            if !self.jvmti.is_modifiable(class) {
                continue;
            }
            match self.jvmti.class_name(class) {
                Ok(Some(name)) => out.entry(name).or_default().push(class),
                Ok(None) => {}
                Err(e) => debug!("unreadable class signature: {}", e),
            }
        }
        out
    }
}

impl ClassHost for JvmClassHost {
    fn loaded_class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modifiable_classes().into_keys().collect();
        names.sort();
        names
    }

    fn set_active_patterns(&self, patterns: Option<Arc<PatternSet>>) {
        *ACTIVE_PATTERNS.write().unwrap_or_else(|e| e.into_inner()) = patterns;
    }

    fn retransform(&self, classes: &[String]) -> RetransformReport {
        drain_hook_failures();

        let by_name = self.modifiable_classes();
        let mut failed: HashSet<String> = HashSet::new();
        for name in classes {
            let Some(refs) = by_name.get(name) else {
                // Unloaded between enumeration and retransform.
                debug!("{} no longer loaded, skipping", name);
                continue;
            };
            for &class in refs {
                if let Err(e) = self.jvmti.retransform_one(class) {
                    warn!("retransform of {} failed: {}", name, e);
                    failed.insert(name.clone());
                }
            }
        }
        failed.extend(drain_hook_failures());

        let mut failed_classes: Vec<String> = failed.into_iter().collect();
        failed_classes.sort();
        RetransformReport { failed_classes }
    }
}

fn drain_hook_failures() -> Vec<String> {
    std::mem::take(&mut *HOOK_FAILURES.lock().unwrap_or_else(|e| e.into_inner()))
}

/// ClassFileLoadHook callback. Runs on VM threads during class load and
/// retransform; it must only read shared state and never call back into
/// Java.
pub unsafe extern "system" fn class_file_load_hook(
    jvmti_env: *mut jvmtiEnv,
    _jni_env: *mut JNIEnv,
    _class_being_redefined: jclass,
    loader: jobject,
    name: *const c_char,
    _protection_domain: jobject,
    class_data_len: jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut c_uchar,
) {
    if name.is_null() || class_data.is_null() {
        return;
    }
    let active = match ACTIVE_PATTERNS.read() {
        Ok(guard) => guard.clone(),
        Err(_) => return,
    };
    let Some(patterns) = active else {
        return;
    };

    let dotted = CStr::from_ptr(name).to_string_lossy().replace('/', ".");
    let jvmti = JvmtiEnv::from_raw(jvmti_env);
    let loader_id = match jvmti.object_loader_id(loader) {
        Ok(id) => id,
        Err(e) => {
            warn!("loader identity for {} failed: {}", dotted, e);
            return;
        }
    };

    let bytes = std::slice::from_raw_parts(class_data, class_data_len as usize);
    match transform(&dotted, bytes, loader_id, &patterns) {
        Ok(Some(rewritten)) => match jvmti.allocate_copy(&rewritten) {
            Ok(mem) => {
                *new_class_data_len = rewritten.len() as jint;
                *new_class_data = mem;
            }
            Err(e) => {
                warn!("allocating rewritten {} failed: {}", dotted, e);
                record_hook_failure(dotted);
            }
        },
        Ok(None) => {}
        Err(e) => {
            warn!("rewriting {} failed: {}", dotted, e);
            record_hook_failure(dotted);
        }
    }
}

fn record_hook_failure(class_name: String) {
    HOOK_FAILURES
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(class_name);
}
