//! Instrumentation session lifecycle: apply, re-apply, remove.
//!
//! The controller is generic over the VM hosting the classes so the whole
//! apply/remove flow is testable without a JVM. One control request is in
//! flight at a time (the command loop serializes them), so the controller
//! itself is single-writer; the instrumentation registry inside each
//! `PatternSet` is the only state written concurrently (by the load hook).

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use metracer_pattern::{count_removed, PatternHistory, PatternSet};
use metracer_protocol::Counters;

/// Abstraction over the VM that owns the classes.
pub trait ClassHost {
    /// Dotted FQCNs of every currently loaded, retransform-capable class.
    fn loaded_class_names(&self) -> Vec<String>;

    /// Make `patterns` current for the class-file load hook; `None` means
    /// subsequent retransforms restore pristine bytes.
    fn set_active_patterns(&self, patterns: Option<Arc<PatternSet>>);

    /// Retransform the named classes through the load hook. Per-class
    /// failures are collected, never propagated; the batch always finishes.
    fn retransform(&self, classes: &[String]) -> RetransformReport;
}

#[derive(Debug, Default)]
pub struct RetransformReport {
    pub failed_classes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Instrumented,
}

pub struct SessionController<H: ClassHost> {
    host: H,
    history: PatternHistory,
    last_applied: Option<Arc<PatternSet>>,
    last_counters: Counters,
    /// Loaded set at the previous pass, for unload detection.
    known_loaded: HashSet<String>,
}

impl<H: ClassHost> SessionController<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            history: PatternHistory::new(),
            last_applied: None,
            last_counters: Counters::default(),
            known_loaded: HashSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        if self.history.is_empty() {
            SessionState::Idle
        } else {
            SessionState::Instrumented
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Instrument everything `set` matches.
    ///
    /// Re-applying a set structurally equal to the last applied one is a
    /// no-op returning the previous counters; otherwise the new set is
    /// applied on top (history grows, earlier instrumentation stays until
    /// `remove_patterns`).
    pub fn apply_patterns(&mut self, set: PatternSet) -> Counters {
        if self.last_applied.as_deref() == Some(&set) {
            debug!("pattern set unchanged, skipping retransform");
            return self.last_counters;
        }

        let loaded = self.host.loaded_class_names();
        self.note_unloaded(&loaded);

        let matched: Vec<String> = loaded
            .iter()
            .filter(|name| set.is_class_matched(name))
            .cloned()
            .collect();
        info!(
            "applying patterns [{}] / [{}]: {} of {} loaded classes match",
            set.class_pattern(),
            set.method_pattern().unwrap_or(""),
            matched.len(),
            loaded.len()
        );

        let set = Arc::new(set);
        self.host.set_active_patterns(Some(Arc::clone(&set)));
        let report = self.host.retransform(&matched);
        for class in &report.failed_classes {
            warn!("failed to instrument {}", class);
        }

        let counters = Counters {
            classes_count: (matched.len() - report.failed_classes.len()) as u32,
            methods_count: set.instrumented_count() as u32,
            failed_classes_count: report.failed_classes.len() as u32,
        };

        self.history.push(Arc::clone(&set));
        self.last_applied = Some(set);
        self.known_loaded = loaded.into_iter().collect();
        self.last_counters = counters;
        counters
    }

    /// Restore every class touched during this session and reset to Idle.
    ///
    /// `methods_count` in the returned counters is the number of distinct
    /// methods removed, unioned across the whole history; classes that were
    /// unloaded in the meantime still count (their instrumentation is gone
    /// with them).
    pub fn remove_patterns(&mut self) -> Counters {
        if self.history.is_empty() {
            return Counters::default();
        }

        let touched = self.history.touched_classes();
        let loaded: HashSet<String> = self.host.loaded_class_names().into_iter().collect();
        let to_restore: Vec<String> = touched
            .iter()
            .map(|identity| identity.class_name.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|name| loaded.contains(name))
            .collect();
        info!("removing instrumentation from {} classes", to_restore.len());

        self.host.set_active_patterns(None);
        let report = self.host.retransform(&to_restore);
        for class in &report.failed_classes {
            warn!("failed to restore {}", class);
        }

        let methods_removed = count_removed(self.history.iter(), &touched);
        let counters = Counters {
            classes_count: (to_restore.len() - report.failed_classes.len()) as u32,
            methods_count: methods_removed as u32,
            failed_classes_count: report.failed_classes.len() as u32,
        };

        self.history.clear();
        self.last_applied = None;
        self.last_counters = Counters::default();
        self.known_loaded.clear();
        counters
    }

    fn note_unloaded(&self, loaded: &[String]) {
        if self.known_loaded.is_empty() {
            return;
        }
        let loaded: HashSet<&String> = loaded.iter().collect();
        for gone in self.known_loaded.iter().filter(|k| !loaded.contains(k)) {
            debug!("class unloaded since last pass: {}", gone);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{transform, WRAPPER_TAG};
    use metracer_classfile::access::ACC_PUBLIC;
    use metracer_classfile::{
        ClassFile, CodeAttribute, ConstantPool, MethodAttribute, MethodInfo,
    };
    use metracer_pattern::LoaderId;
    use metracer_protocol::StackTraceMode;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Host keeping class bytes in memory; retransforms run the real
    /// transformer against pristine bytes, exactly like a retransform
    /// barrier would.
    struct MemoryHost {
        pristine: HashMap<String, Vec<u8>>,
        current: RefCell<HashMap<String, Vec<u8>>>,
        active: RefCell<Option<Arc<PatternSet>>>,
    }

    impl MemoryHost {
        fn new(classes: Vec<(&str, Vec<u8>)>) -> Self {
            let pristine: HashMap<String, Vec<u8>> = classes
                .into_iter()
                .map(|(n, b)| (n.to_string(), b))
                .collect();
            let current = RefCell::new(pristine.clone());
            Self {
                pristine,
                current,
                active: RefCell::new(None),
            }
        }

        fn bytes_of(&self, name: &str) -> Vec<u8> {
            self.current.borrow()[name].clone()
        }
    }

    impl ClassHost for MemoryHost {
        fn loaded_class_names(&self) -> Vec<String> {
            self.pristine.keys().cloned().collect()
        }

        fn set_active_patterns(&self, patterns: Option<Arc<PatternSet>>) {
            *self.active.borrow_mut() = patterns;
        }

        fn retransform(&self, classes: &[String]) -> RetransformReport {
            let mut report = RetransformReport::default();
            let active = self.active.borrow().clone();
            for name in classes {
                let pristine = self.pristine[name].clone();
                let result = match &active {
                    None => Ok(Some(pristine.clone())),
                    Some(set) => transform(name, &pristine, LoaderId(0), set),
                };
                match result {
                    Ok(Some(bytes)) => {
                        self.current.borrow_mut().insert(name.clone(), bytes);
                    }
                    Ok(None) => {
                        self.current.borrow_mut().insert(name.clone(), pristine);
                    }
                    Err(_) => report.failed_classes.push(name.clone()),
                }
            }
            report
        }
    }

    fn class_with_method(internal_name: &str, method: &str) -> Vec<u8> {
        let mut pool = ConstantPool::new();
        let this_class = pool.ensure_class(internal_name).unwrap();
        let super_class = pool.ensure_class("java/lang/Object").unwrap();
        let code_name = pool.ensure_utf8("Code").unwrap();
        let name_index = pool.ensure_utf8(method).unwrap();
        let descriptor_index = pool.ensure_utf8("()V").unwrap();

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
                access_flags: ACC_PUBLIC,
                name_index,
                descriptor_index,
                attributes: vec![MethodAttribute::Code {
                    name_index: code_name,
                    code: CodeAttribute {
                        max_stack: 0,
                        max_locals: 1,
                        code: vec![0xb1],
                        exception_table: Vec::new(),
                        attributes: Vec::new(),
                    },
                }],
            }],
            attributes: Vec::new(),
        }
        .write()
    }

    fn pattern(class: &str, method: Option<&str>) -> PatternSet {
        PatternSet::compile(class, method, StackTraceMode::Disabled).unwrap()
    }

    fn has_wrapper(bytes: &[u8]) -> bool {
        let class = ClassFile::parse(bytes).unwrap();
        class
            .methods
            .iter()
            .any(|m| m.name(&class.constant_pool).unwrap().contains(WRAPPER_TAG))
    }

    fn session() -> SessionController<MemoryHost> {
        let host = MemoryHost::new(vec![
            ("com.app.Worker", class_with_method("com/app/Worker", "doWork")),
            ("com.app.Manager", class_with_method("com/app/Manager", "plan")),
            ("org.lib.Util", class_with_method("org/lib/Util", "help")),
        ]);
        SessionController::new(host)
    }

    #[test]
    fn test_apply_instruments_matching_classes_only() {
        let mut s = session();
        let counters = s.apply_patterns(pattern("com\\.app\\..*", Some("doWork")));

        assert_eq!(counters.classes_count, 2, "both com.app classes match");
        assert_eq!(counters.methods_count, 1, "only doWork matched");
        assert_eq!(counters.failed_classes_count, 0);
        assert_eq!(s.state(), SessionState::Instrumented);

        assert!(has_wrapper(&s.host().bytes_of("com.app.Worker")));
        assert!(!has_wrapper(&s.host().bytes_of("com.app.Manager")));
        assert!(!has_wrapper(&s.host().bytes_of("org.lib.Util")));
    }

    #[test]
    fn test_reapplying_equal_set_is_idempotent() {
        let mut s = session();
        let first = s.apply_patterns(pattern("com\\.app\\..*", None));
        let again = s.apply_patterns(pattern("com\\.app\\..*", None));
        assert_eq!(first, again);
    }

    #[test]
    fn test_remove_restores_pristine_bytes_and_counts_methods() {
        let mut s = session();
        let pristine = s.host().bytes_of("com.app.Worker");
        s.apply_patterns(pattern("com\\.app\\..*", Some("doWork")));
        assert_ne!(s.host().bytes_of("com.app.Worker"), pristine);

        let counters = s.remove_patterns();
        assert_eq!(counters.methods_count, 1);
        assert_eq!(s.host().bytes_of("com.app.Worker"), pristine);
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn test_layered_patterns_accumulate_and_remove_together() {
        let mut s = session();
        s.apply_patterns(pattern("com\\.app\\.Worker", None));
        s.apply_patterns(pattern("com\\.app\\.Manager", None));
        assert_eq!(s.state(), SessionState::Instrumented);

        let counters = s.remove_patterns();
        // doWork from the first set, plan from the second.
        assert_eq!(counters.methods_count, 2);
        assert!(!has_wrapper(&s.host().bytes_of("com.app.Worker")));
        assert!(!has_wrapper(&s.host().bytes_of("com.app.Manager")));
    }

    #[test]
    fn test_remove_when_idle_reports_zeros() {
        let mut s = session();
        assert_eq!(s.remove_patterns(), Counters::default());
    }
}
