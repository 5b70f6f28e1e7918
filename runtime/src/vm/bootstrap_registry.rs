//! Well-known names and bootstrap class ids, interned once at startup.

use crate::error::VmError;
use crate::keys::{ClassId, MethodKey, Symbol};
use crate::utf8::Utf8Pool;
use once_cell::sync::OnceCell;

pub struct BootstrapRegistry {
    pub java_lang_object_sym: Symbol,
    pub java_lang_class_sym: Symbol,
    pub java_lang_string_sym: Symbol,
    pub java_lang_thread_sym: Symbol,
    pub java_lang_throwable_sym: Symbol,
    pub char_array_sym: Symbol,
    pub string_array_sym: Symbol,

    pub init_sym: Symbol,
    pub clinit_sym: Symbol,
    pub main_sym: Symbol,
    pub main_desc_sym: Symbol,
    pub run_sym: Symbol,
    pub finalize_sym: Symbol,
    pub void_desc_sym: Symbol,
    pub message_sym: Symbol,
    pub string_desc_sym: Symbol,

    java_lang_object_id: OnceCell<ClassId>,
    java_lang_class_id: OnceCell<ClassId>,
    java_lang_string_id: OnceCell<ClassId>,
    java_lang_thread_id: OnceCell<ClassId>,
    java_lang_throwable_id: OnceCell<ClassId>,
}

impl BootstrapRegistry {
    pub fn new(names: &Utf8Pool) -> Self {
        Self {
            java_lang_object_sym: names.intern_str("java/lang/Object"),
            java_lang_class_sym: names.intern_str("java/lang/Class"),
            java_lang_string_sym: names.intern_str("java/lang/String"),
            java_lang_thread_sym: names.intern_str("java/lang/Thread"),
            java_lang_throwable_sym: names.intern_str("java/lang/Throwable"),
            char_array_sym: names.intern_str("[C"),
            string_array_sym: names.intern_str("[Ljava/lang/String;"),
            init_sym: names.intern_str("<init>"),
            clinit_sym: names.intern_str("<clinit>"),
            main_sym: names.intern_str("main"),
            main_desc_sym: names.intern_str("([Ljava/lang/String;)V"),
            run_sym: names.intern_str("run"),
            finalize_sym: names.intern_str("finalize"),
            void_desc_sym: names.intern_str("()V"),
            message_sym: names.intern_str("message"),
            string_desc_sym: names.intern_str("Ljava/lang/String;"),
            java_lang_object_id: OnceCell::new(),
            java_lang_class_id: OnceCell::new(),
            java_lang_string_id: OnceCell::new(),
            java_lang_thread_id: OnceCell::new(),
            java_lang_throwable_id: OnceCell::new(),
        }
    }

    pub fn main_key(&self) -> MethodKey {
        MethodKey {
            name: self.main_sym,
            desc: self.main_desc_sym,
        }
    }

    pub fn run_key(&self) -> MethodKey {
        MethodKey {
            name: self.run_sym,
            desc: self.void_desc_sym,
        }
    }

    pub fn finalize_key(&self) -> MethodKey {
        MethodKey {
            name: self.finalize_sym,
            desc: self.void_desc_sym,
        }
    }

    fn missing(what: &str) -> VmError {
        VmError::VirtualMachine(format!("bootstrap class {} is not loaded yet", what))
    }

    pub fn set_java_lang_object_id(&self, id: ClassId) {
        let _ = self.java_lang_object_id.set(id);
    }

    pub fn java_lang_object_id(&self) -> Result<ClassId, VmError> {
        self.java_lang_object_id
            .get()
            .copied()
            .ok_or_else(|| Self::missing("java/lang/Object"))
    }

    pub fn set_java_lang_class_id(&self, id: ClassId) {
        let _ = self.java_lang_class_id.set(id);
    }

    pub fn java_lang_class_id(&self) -> Result<ClassId, VmError> {
        self.java_lang_class_id
            .get()
            .copied()
            .ok_or_else(|| Self::missing("java/lang/Class"))
    }

    pub fn set_java_lang_string_id(&self, id: ClassId) {
        let _ = self.java_lang_string_id.set(id);
    }

    pub fn java_lang_string_id(&self) -> Result<ClassId, VmError> {
        self.java_lang_string_id
            .get()
            .copied()
            .ok_or_else(|| Self::missing("java/lang/String"))
    }

    pub fn set_java_lang_thread_id(&self, id: ClassId) {
        let _ = self.java_lang_thread_id.set(id);
    }

    pub fn java_lang_thread_id(&self) -> Result<ClassId, VmError> {
        self.java_lang_thread_id
            .get()
            .copied()
            .ok_or_else(|| Self::missing("java/lang/Thread"))
    }

    pub fn set_java_lang_throwable_id(&self, id: ClassId) {
        let _ = self.java_lang_throwable_id.set(id);
    }

    pub fn java_lang_throwable_id(&self) -> Result<ClassId, VmError> {
        self.java_lang_throwable_id
            .get()
            .copied()
            .ok_or_else(|| Self::missing("java/lang/Throwable"))
    }
}
