//! Class loading and linking.
//!
//! The class table grows only; an entry is created in `Preloaded` state the
//! first time its name is resolved and advances through
//! `Linking -> Linked` while its class file is derived. Observing a class
//! in `Linking` during a recursive derivation means the class graph is
//! circular, which CLDC reports as `NoClassDefFoundError`. Array classes
//! are synthesised instead of derived; they inherit from `Object` and alias
//! its dispatch table.

use crate::class_loader::ClassPath;
use crate::classfile::RawClassFile;
use crate::classfile::flags::ClassFlags;
use crate::cpool::{ClassEntry, ConstantPool, FieldrefEntry, MethodrefEntry};
use crate::error::VmError;
use crate::heap::{HEADER_WORDS, WORD};
use crate::keys::{ClassId, FieldId, FieldKey, MethodId, Symbol};
use crate::native::NativeRegistry;
use crate::rt::field::{Field, FieldKind, FieldManager};
use crate::rt::method::{
    METHOD_ARGUMENTS_MAX, METHOD_INDEX_MAX, Method, MethodCode, MethodManager,
    descriptor_arg_slots, descriptor_return_slots,
};
use crate::rt::{
    ArrayElement, ArrayInfo, ArrayType, Class, ClassState, Derived, ITable, InstanceLayout,
};
use crate::utf8::Utf8Pool;
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;
use tracing_log::log::debug;

/// Read-only collaborators threaded through loading.
pub struct LoaderCtx<'a> {
    pub classpath: &'a ClassPath,
    pub natives: &'a NativeRegistry,
}

pub struct ClassTable {
    names: Utf8Pool,
    classes: Vec<Arc<Class>>,
    by_name: HashMap<Symbol, ClassId>,
    /// Process-wide interface-method selector counter.
    next_interface_selector: u32,
    /// Primitive array classes indexed by `ArrayType as u8 - 4`.
    array_by_type: [Option<ClassId>; 8],
}

impl ClassTable {
    pub fn new(names: Utf8Pool) -> Self {
        Self {
            names,
            classes: Vec::with_capacity(64),
            by_name: HashMap::new(),
            next_interface_selector: 0,
            array_by_type: [None; 8],
        }
    }

    pub fn names(&self) -> &Utf8Pool {
        &self.names
    }

    pub fn classes(&self) -> &[Arc<Class>] {
        &self.classes
    }

    pub fn get(&self, id: ClassId) -> Arc<Class> {
        self.classes[id.to_index()].clone()
    }

    pub fn get_ref(&self, id: ClassId) -> &Class {
        &self.classes[id.to_index()]
    }

    pub fn find(&self, name: Symbol) -> Option<ClassId> {
        self.by_name.get(&name).copied()
    }

    pub fn array_class_by_type(&self, atype: ArrayType) -> Option<ClassId> {
        self.array_by_type[u8::from(atype) as usize - 4]
    }

    fn push_preloaded(&mut self, name: Symbol) -> ClassId {
        let id = ClassId::from_usize(self.classes.len() + 1);
        self.classes.push(Arc::new(Class::preloaded(id, name)));
        self.by_name.insert(name, id);
        id
    }

    /// Resolves `name` on behalf of `orig`, deriving the class if needed and
    /// enforcing package visibility.
    #[hotpath::measure]
    pub fn resolve(
        &mut self,
        ctx: &LoaderCtx<'_>,
        orig: Option<ClassId>,
        name: Symbol,
    ) -> Result<ClassId, VmError> {
        let id = match self.find(name) {
            Some(id) => {
                let class = self.get(id);
                match class.state() {
                    // Only one thread at a time runs the loader, so meeting
                    // a class still in `Linking` here means the class graph
                    // is circular.
                    ClassState::Linking => {
                        return Err(VmError::NoClassDefFound(
                            "circular dependency found in the class graph".to_string(),
                        ));
                    }
                    ClassState::Erroneous => {
                        return Err(VmError::NoClassDefFound(format!(
                            "class {} is erroneous",
                            self.names.resolve(&name)
                        )));
                    }
                    ClassState::Dummy | ClassState::Preloaded => {
                        self.load_class_guarded(ctx, id)?;
                    }
                    _ => {}
                }
                id
            }
            None => {
                let id = self.push_preloaded(name);
                self.load_class_guarded(ctx, id)?;
                id
            }
        };

        if let Some(orig_id) = orig {
            self.check_class_access(orig_id, id)?;
        }

        Ok(id)
    }

    fn load_class_guarded(&mut self, ctx: &LoaderCtx<'_>, id: ClassId) -> Result<(), VmError> {
        match self.load_class(ctx, id) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.get_ref(id).set_state(ClassState::Erroneous);
                Err(err)
            }
        }
    }

    #[hotpath::measure]
    fn load_class(&mut self, ctx: &LoaderCtx<'_>, id: ClassId) -> Result<(), VmError> {
        let class = self.get(id);
        class.set_state(ClassState::Linking);

        let name = self.names.resolve(&class.name).to_owned();
        if name.is_empty() {
            return Err(VmError::NoClassDefFound("malformed class name".to_string()));
        }

        if name.starts_with('[') {
            self.synthesize_array(ctx, id, &name)?;
        } else {
            let bytes = ctx.classpath.read_class(&name)?;
            let raw = RawClassFile::parse(&bytes, &self.names)?;
            self.derive(ctx, id, raw)?;
        }

        debug!("class {} linked as id {}", name, id.as_raw());
        class.set_state(ClassState::Linked);
        Ok(())
    }

    /// Builds an array class from its name alone.
    fn synthesize_array(
        &mut self,
        ctx: &LoaderCtx<'_>,
        id: ClassId,
        name: &str,
    ) -> Result<(), VmError> {
        let bytes = name.as_bytes();
        if bytes.len() < 2 {
            return Err(VmError::NoClassDefFound(
                "malformed array class name".to_string(),
            ));
        }

        let dimensions = bytes.iter().take_while(|&&b| b == b'[').count();
        if dimensions > u8::MAX as usize {
            return Err(VmError::NoClassDefFound(
                "malformed array class name".to_string(),
            ));
        }

        let (element, access_flags) = match bytes[1] {
            b'[' => {
                // Multi-dimensional: the element is the nested array class.
                let elem_sym = self.names.intern_str(&name[1..]);
                let elem = self.resolve(ctx, None, elem_sym)?;
                (
                    ArrayElement::Reference(elem),
                    self.get_ref(elem).flags(),
                )
            }
            b'L' => {
                if bytes.len() < 4 || bytes[bytes.len() - 1] != b';' {
                    return Err(VmError::NoClassDefFound(
                        "malformed array class name".to_string(),
                    ));
                }
                let elem_sym = self.names.intern_str(&name[2..name.len() - 1]);
                let elem = self.resolve(ctx, None, elem_sym)?;
                (
                    ArrayElement::Reference(elem),
                    self.get_ref(elem).flags(),
                )
            }
            prim => {
                let atype = ArrayType::from_descriptor_char(prim).ok_or_else(|| {
                    VmError::NoClassDefFound("malformed array class name".to_string())
                })?;
                self.array_by_type[u8::from(atype) as usize - 4] = Some(id);
                (
                    ArrayElement::Primitive(atype),
                    ClassFlags::from_raw(
                        crate::classfile::flags::ACC_PUBLIC
                            | crate::classfile::flags::ACC_FINAL
                            | crate::classfile::flags::ACC_ABSTRACT,
                    ),
                )
            }
        };

        let object_sym = self.names.intern_str("java/lang/Object");
        let object_id = self.resolve(ctx, None, object_sym)?;
        let dtable = self.get_ref(object_id).dtable().to_vec().into_boxed_slice();

        self.get_ref(id).publish_derived(Derived {
            access_flags,
            parent: Some(object_id),
            array: Some(ArrayInfo {
                dimensions: dimensions as u8,
                element,
            }),
            has_finalizer: false,
            is_weakref: false,
            cp: ConstantPool::dummy(),
            layout: InstanceLayout::default(),
            fields: FieldManager::empty(),
            methods: MethodManager::empty(),
            interfaces: Box::new([]),
            dtable,
            itable: ITable::default(),
        });

        Ok(())
    }

    /// Derives a class from its parsed class file.
    fn derive(
        &mut self,
        ctx: &LoaderCtx<'_>,
        id: ClassId,
        raw: RawClassFile,
    ) -> Result<(), VmError> {
        let class = self.get(id);
        let flags = raw.access_flags;

        if flags.is_interface() {
            if !flags.is_abstract() || flags.is_final() {
                return Err(VmError::NoClassDefFound(
                    "interface class has ACC_ABSTRACT not set or ACC_FINAL set".to_string(),
                ));
            }
        } else if flags.is_abstract() && flags.is_final() {
            return Err(VmError::NoClassDefFound(
                "abstract class has ACC_FINAL flag set".to_string(),
            ));
        }

        if raw.class_name(raw.this_class)? != class.name {
            return Err(VmError::NoClassDefFound(
                "internal class name does not match the provided one".to_string(),
            ));
        }

        let parent = if raw.super_class == 0 {
            // Only java.lang.Object omits the super class.
            if flags.is_final() || !flags.is_public() || flags.is_interface() || flags.is_abstract()
            {
                return Err(VmError::NoClassDefFound(
                    "a parentless class must be public, non-final, non-abstract and not an \
                     interface"
                        .to_string(),
                ));
            }
            None
        } else {
            let parent_name = raw.class_name(raw.super_class)?;
            let parent_id = self.resolve(ctx, Some(id), parent_name)?;
            let parent = self.get_ref(parent_id);

            if parent.is_interface() || parent.flags().is_final() || parent.is_array() {
                return Err(VmError::NoClassDefFound(
                    "parent class is either an interface, final or an array class".to_string(),
                ));
            }

            if flags.is_interface() && self.names.resolve(&parent.name) != "java/lang/Object" {
                return Err(VmError::NoClassDefFound(
                    "interface has a parent different from java.lang.Object".to_string(),
                ));
            }

            Some(parent_id)
        };

        let interfaces = self.load_interfaces(ctx, id, parent, &raw)?;

        let mut fields = Vec::with_capacity(raw.fields.len());
        for raw_field in &raw.fields {
            let desc_str = self.names.resolve(&raw_field.desc).to_owned();
            fields.push(Field::new(
                raw_field.name,
                raw_field.desc,
                raw_field.flags,
                FieldKind::from_descriptor(&desc_str)?,
                raw_field.constant_value,
            ));
        }

        let class_name_str = self.names.resolve(&class.name).to_owned();
        let parent_layout = parent
            .map(|pid| self.get_ref(pid).layout())
            .unwrap_or_default();
        let layout = layout_fields(&fields, parent_layout, &class_name_str)?;

        let (mut methods, declares_finalizer) =
            self.load_methods(ctx, id, &class_name_str, flags, &raw)?;

        let has_finalizer = match parent {
            Some(pid) => self.get_ref(pid).derived().has_finalizer || declares_finalizer,
            // java.lang.Object declares an empty finalize(), never flagged.
            None => false,
        };

        let is_weakref = class_name_str == "java/lang/ref/Reference"
            || parent
                .map(|pid| self.get_ref(pid).derived().is_weakref)
                .unwrap_or(false);

        let (dtable, itable) = if flags.is_interface() {
            self.assign_interface_selectors(&mut methods)?;
            (Box::new([]) as Box<[MethodId]>, ITable::default())
        } else {
            let dtable = self.create_dispatch_table(id, parent, &mut methods)?;
            let itable = self.create_interface_dispatch_table(id, &interfaces, &dtable, &methods);
            (dtable, itable)
        };

        let cp = ConstantPool::new(&raw.constants);
        cp.set_owner(id);

        class.publish_derived(Derived {
            access_flags: flags,
            parent,
            array: None,
            has_finalizer,
            is_weakref,
            cp,
            layout,
            fields: FieldManager::new(fields),
            methods: MethodManager::new(methods),
            interfaces,
            dtable,
            itable,
        });

        Ok(())
    }

    fn load_interfaces(
        &mut self,
        ctx: &LoaderCtx<'_>,
        id: ClassId,
        parent: Option<ClassId>,
        raw: &RawClassFile,
    ) -> Result<Box<[ClassId]>, VmError> {
        let mut set: Vec<ClassId> = parent
            .map(|pid| self.get_ref(pid).interfaces().to_vec())
            .unwrap_or_default();

        for &iface_idx in &raw.interfaces {
            let iface_name = raw.class_name(iface_idx)?;
            let iface_id = self.resolve(ctx, Some(id), iface_name)?;

            if !self.get_ref(iface_id).is_interface() {
                return Err(VmError::NoClassDefFound(
                    "non-interface class implemented as an interface".to_string(),
                ));
            }

            if !set.contains(&iface_id) {
                set.push(iface_id);
            }
            for &transitive in self.get_ref(iface_id).interfaces() {
                if !set.contains(&transitive) {
                    set.push(transitive);
                }
            }
        }

        Ok(set.into_boxed_slice())
    }

    fn load_methods(
        &mut self,
        ctx: &LoaderCtx<'_>,
        id: ClassId,
        class_name: &str,
        class_flags: ClassFlags,
        raw: &RawClassFile,
    ) -> Result<(Vec<Method>, bool), VmError> {
        let clinit_sym = self.names.intern_str("<clinit>");
        let finalize_sym = self.names.intern_str("finalize");
        let void_desc_sym = self.names.intern_str("()V");

        let mut methods = Vec::with_capacity(raw.methods.len());
        let mut declares_finalizer = false;

        for raw_method in &raw.methods {
            let desc_str = self.names.resolve(&raw_method.desc).to_owned();
            let mut args_size = descriptor_arg_slots(&desc_str)?;
            if !raw_method.flags.is_static() {
                args_size += 1;
            }

            if args_size > METHOD_ARGUMENTS_MAX {
                return Err(VmError::NoClassDefFound(
                    "method argument stack size exceeds the VM limits".to_string(),
                ));
            }

            let code = if raw_method.flags.is_native() {
                // Natives are linked immediately; a missing body is an
                // unresolved-native error at class-link time.
                let native = ctx
                    .natives
                    .lookup_by_names(class_name, raw_method.name, raw_method.desc)
                    .ok_or_else(|| {
                        VmError::VirtualMachine(format!(
                            "unresolved native method {}.{}",
                            class_name,
                            self.names.resolve(&raw_method.name)
                        ))
                    })?;
                MethodCode::Native(native)
            } else if raw_method.flags.is_abstract() {
                MethodCode::Abstract
            } else {
                let raw_code = raw_method.code.ok_or_else(|| {
                    VmError::NoClassDefFound(format!(
                        "method {}.{} has no Code attribute",
                        class_name,
                        self.names.resolve(&raw_method.name)
                    ))
                })?;
                MethodCode::Unlinked(raw_code)
            };

            if class_flags.is_interface() {
                let is_clinit =
                    raw_method.name == clinit_sym && raw_method.desc == void_desc_sym;
                if raw_method.flags.is_static() && !is_clinit {
                    return Err(VmError::NoClassDefFound(
                        "interface has a static method".to_string(),
                    ));
                }
                if !is_clinit {
                    if !raw_method.flags.is_public() {
                        return Err(VmError::NoClassDefFound(
                            "interface has a non-public method".to_string(),
                        ));
                    }
                    if !raw_method.flags.is_abstract() {
                        return Err(VmError::NoClassDefFound(
                            "interface has a non-abstract method".to_string(),
                        ));
                    }
                }
            } else if raw_method.name == finalize_sym && raw_method.desc == void_desc_sym {
                declares_finalizer = true;
            }

            methods.push(Method::new(
                id,
                raw_method.name,
                raw_method.desc,
                raw_method.flags,
                args_size,
                descriptor_return_slots(&desc_str)?,
                code,
            ));
        }

        Ok((methods, declares_finalizer))
    }

    /// Gives every interface method a process-wide unique selector. The
    /// selector travels in the 12-bit half of the packed method index, so
    /// it shares the dispatch-table limit.
    fn assign_interface_selectors(&mut self, methods: &mut [Method]) -> Result<(), VmError> {
        for method in methods.iter_mut() {
            if self.next_interface_selector >= METHOD_INDEX_MAX as u32 {
                return Err(VmError::NoClassDefFound(
                    "interface method selectors exceed the VM limits".to_string(),
                ));
            }
            method.index = self.next_interface_selector as u16;
            self.next_interface_selector += 1;
        }
        Ok(())
    }

    /// Builds the virtual dispatch table: the parent's table extended with
    /// the new methods, overriding where name and descriptor match.
    fn create_dispatch_table(
        &self,
        id: ClassId,
        parent: Option<ClassId>,
        methods: &mut [Method],
    ) -> Result<Box<[MethodId]>, VmError> {
        let parent_dtable: Vec<MethodId> = parent
            .map(|pid| self.get_ref(pid).dtable().to_vec())
            .unwrap_or_default();
        let old_count = parent_dtable.len();
        let mut new_count = old_count;

        for method in methods.iter_mut() {
            let name_str = self.names.resolve(&method.name);

            // Static, init and private methods are invoked directly and
            // never enter the table.
            if method.is_static() || method.flags.is_private() || name_str.starts_with('<') {
                method.index = 0;
                continue;
            }

            let mut found = false;
            for (slot, &overridden_id) in parent_dtable.iter().enumerate() {
                let overridden = self.method_ref(overridden_id);
                if overridden.name == method.name && overridden.desc == method.desc {
                    if overridden.flags.is_final() {
                        return Err(VmError::NoClassDefFound(
                            "a method overrides a final method".to_string(),
                        ));
                    }
                    let weakened = (overridden.flags.is_public() && !method.flags.is_public())
                        || (overridden.flags.is_protected()
                            && !(method.flags.is_protected() || method.flags.is_public()));
                    if weakened {
                        return Err(VmError::NoClassDefFound(
                            "a method is overridden by another method with weaker access \
                             privileges"
                                .to_string(),
                        ));
                    }
                    method.index = slot as u16;
                    found = true;
                    break;
                }
            }

            if !found {
                if new_count >= METHOD_INDEX_MAX as usize {
                    return Err(VmError::NoClassDefFound(
                        "number of dispatch table entries exceeds the VM limits".to_string(),
                    ));
                }
                method.index = new_count as u16;
                new_count += 1;
            }
        }

        let mut dtable = vec![MethodId::new(id, 0); new_count];
        dtable[..old_count].copy_from_slice(&parent_dtable);

        for (decl_idx, method) in methods.iter().enumerate() {
            let name_str = self.names.resolve(&method.name);
            if !(method.is_static() || method.flags.is_private() || name_str.starts_with('<')) {
                dtable[method.index as usize] = MethodId::new(id, decl_idx as u16);
            }
        }

        Ok(dtable.into_boxed_slice())
    }

    /// Builds the interface dispatch table: selectors paired with the
    /// concrete methods implementing them, sorted by selector for the
    /// binary search done by invoke-interface.
    fn create_interface_dispatch_table(
        &self,
        this_id: ClassId,
        interfaces: &[ClassId],
        dtable: &[MethodId],
        methods: &[Method],
    ) -> ITable {
        // Entries of the class under derivation cannot be fetched through
        // the table yet, they come from the local slice.
        let method_key = |id: MethodId| {
            if id.class == this_id {
                let method = &methods[id.index as usize];
                (method.name, method.desc)
            } else {
                let method = self.method_ref(id);
                (method.name, method.desc)
            }
        };

        let mut pairs: Vec<(u16, MethodId)> = Vec::new();

        for &iface_id in interfaces {
            let iface = self.get_ref(iface_id);
            for (decl_idx, iface_method) in iface.methods().iter().enumerate() {
                if self.names.resolve(&iface_method.name).starts_with('<') {
                    continue;
                }

                // Replace the interface method with the concrete method
                // implementing it; abstract classes may leave it in place.
                let mut target = MethodId::new(iface_id, decl_idx as u16);
                for &impl_id in dtable {
                    let (name, desc) = method_key(impl_id);
                    if name == iface_method.name && desc == iface_method.desc {
                        target = impl_id;
                        break;
                    }
                }

                pairs.push((iface_method.index, target));
            }
        }

        let pairs = pairs
            .into_iter()
            .sorted_by_key(|(selector, _)| *selector)
            .collect::<Vec<_>>();

        ITable {
            selectors: pairs.iter().map(|(selector, _)| *selector).collect(),
            methods: pairs.into_iter().map(|(_, method)| method).collect(),
        }
    }

    pub fn method_ref(&self, id: MethodId) -> &Method {
        self.get_ref(id.class).methods().get(id.index)
    }

    pub fn field_ref(&self, id: FieldId) -> &Field {
        self.get_ref(id.class).fields().get(id.index)
    }

    // Visibility checks.

    fn same_package(&self, a: ClassId, b: ClassId) -> bool {
        let a_name = self.names.resolve(&self.get_ref(a).name);
        let b_name = self.names.resolve(&self.get_ref(b).name);
        Class::package_of(a_name) == Class::package_of(b_name)
    }

    fn is_parent_of(&self, maybe_parent: ClassId, child: ClassId) -> bool {
        let mut cur = self.get_ref(child).parent();
        while let Some(id) = cur {
            if id == maybe_parent {
                return true;
            }
            cur = self.get_ref(id).parent();
        }
        false
    }

    fn check_class_access(&self, orig: ClassId, target: ClassId) -> Result<(), VmError> {
        let mut checked = target;

        // For arrays the check climbs down to the element type.
        while let Some(info) = self.get_ref(checked).derived().array.as_ref() {
            match info.element {
                ArrayElement::Reference(elem) => checked = elem,
                ArrayElement::Primitive(_) => return Ok(()),
            }
        }

        if self.get_ref(checked).flags().is_public() || self.same_package(checked, orig) {
            Ok(())
        } else {
            Err(VmError::NoClassDefFound(format!(
                "class {} cannot reference class {}",
                self.names.resolve(&self.get_ref(orig).name),
                self.names.resolve(&self.get_ref(target).name)
            )))
        }
    }

    fn check_member_access(
        &self,
        orig: ClassId,
        owner: ClassId,
        is_public: bool,
        is_private: bool,
        is_protected: bool,
        what: &str,
    ) -> Result<(), VmError> {
        if is_public {
            return Ok(());
        }

        if is_private {
            if orig != owner {
                return Err(VmError::NoClassDefFound(format!(
                    "trying to access a private {} from an external class",
                    what
                )));
            }
        } else if is_protected {
            if !(orig == owner
                || self.is_parent_of(owner, orig)
                || self.same_package(owner, orig))
            {
                return Err(VmError::NoClassDefFound(format!(
                    "trying to access a protected {} from a non-child class of a different \
                     package",
                    what
                )));
            }
        } else if !self.same_package(owner, orig) {
            return Err(VmError::NoClassDefFound(format!(
                "trying to access a package-visible {} from a different package",
                what
            )));
        }

        Ok(())
    }

    // Constant-pool resolution. Every function checks the tag first and
    // returns the cached direct id when the entry is already resolved,
    // otherwise it performs the lookup and rewrites the entry in place.

    pub fn resolve_cp_class(
        &mut self,
        ctx: &LoaderCtx<'_>,
        owner: ClassId,
        idx: u16,
    ) -> Result<ClassId, VmError> {
        match self.get_ref(owner).cp().get_class_entry(idx)? {
            ClassEntry::Resolved(id) => Ok(id),
            ClassEntry::Symbolic(name) => {
                let id = self.resolve(ctx, Some(owner), name)?;
                self.get_ref(owner).cp().resolve_class(idx, id);
                Ok(id)
            }
        }
    }

    /// Field lookup per the VM spec: the class itself, then (for statics)
    /// its interfaces, then up the parent chain.
    fn lookup_field(
        &self,
        from: ClassId,
        key: &FieldKey,
        is_static: bool,
    ) -> Option<FieldId> {
        let mut cur = Some(from);

        while let Some(id) = cur {
            let class = self.get_ref(id);
            if let Some((index, _)) = class.fields().find(key, is_static) {
                return Some(FieldId::new(id, index));
            }

            if is_static {
                for &iface in class.interfaces() {
                    if let Some((index, _)) = self.get_ref(iface).fields().find(key, true) {
                        return Some(FieldId::new(iface, index));
                    }
                }
            }

            cur = class.parent();
        }

        None
    }

    pub fn resolve_cp_field(
        &mut self,
        ctx: &LoaderCtx<'_>,
        owner: ClassId,
        idx: u16,
        is_static: bool,
    ) -> Result<FieldId, VmError> {
        let entry = self.get_ref(owner).cp().get_fieldref_entry(idx)?;

        let (class_idx, key) = match entry {
            FieldrefEntry::Resolved(id) => return Ok(id),
            FieldrefEntry::Symbolic { class_idx, key } => (class_idx, key),
        };

        let target = self.resolve_cp_class(ctx, owner, class_idx)?;
        let field_id = self.lookup_field(target, &key, is_static).ok_or_else(|| {
            VmError::NoClassDefFound(format!(
                "field {}.{} not found",
                self.names.resolve(&self.get_ref(target).name),
                self.names.resolve(&key.name)
            ))
        })?;

        let field = self.field_ref(field_id);
        self.check_member_access(
            owner,
            field_id.class,
            field.flags.is_public(),
            field.flags.is_private(),
            field.flags.is_protected(),
            "field",
        )?;

        self.get_ref(owner).cp().resolve_field(idx, field_id);
        Ok(field_id)
    }

    pub fn resolve_cp_method(
        &mut self,
        ctx: &LoaderCtx<'_>,
        owner: ClassId,
        idx: u16,
        interface: bool,
    ) -> Result<MethodId, VmError> {
        let entry = self
            .get_ref(owner)
            .cp()
            .get_methodref_entry(idx, interface)?;

        let (class_idx, key) = match entry {
            MethodrefEntry::Resolved(id) => return Ok(id),
            MethodrefEntry::Symbolic { class_idx, key } => (class_idx, key),
        };

        let target = self.resolve_cp_class(ctx, owner, class_idx)?;
        let target_class = self.get_ref(target);

        if !interface && target_class.is_interface() {
            return Err(VmError::VirtualMachine(
                "trying to resolve a method from an interface".to_string(),
            ));
        }
        if interface && !target_class.is_interface() {
            return Err(VmError::VirtualMachine(
                "trying to resolve an interface method from a class".to_string(),
            ));
        }

        // Walk the parent chain, then fall back to the interfaces.
        let mut resolved = None;
        let mut cur = Some(target);
        while let Some(id) = cur {
            let class = self.get_ref(id);
            if let Some((index, _)) = class.methods().find(&key) {
                resolved = Some(MethodId::new(id, index));
                break;
            }
            cur = class.parent();
        }

        if resolved.is_none() {
            for &iface in self.get_ref(target).interfaces() {
                if let Some((index, _)) = self.get_ref(iface).methods().find(&key) {
                    resolved = Some(MethodId::new(iface, index));
                    break;
                }
            }
        }

        let method_id = resolved.ok_or_else(|| {
            VmError::VirtualMachine(format!(
                "unable to resolve method {}.{}{}",
                self.names.resolve(&self.get_ref(target).name),
                self.names.resolve(&key.name),
                self.names.resolve(&key.desc)
            ))
        })?;

        let method = self.method_ref(method_id);

        if self.names.resolve(&method.name).starts_with('<') && method_id.class != target {
            // Initialization methods must come from the directly referenced
            // class.
            return Err(VmError::VirtualMachine(
                "error while resolving an initialization method".to_string(),
            ));
        }

        if method.is_abstract() && !self.get_ref(method_id.class).flags().is_abstract() {
            return Err(VmError::NoClassDefFound(
                "abstract method resolved from a non-abstract class".to_string(),
            ));
        }

        self.check_member_access(
            owner,
            method_id.class,
            method.flags.is_public(),
            method.flags.is_private(),
            method.flags.is_protected(),
            "method",
        )?;

        self.get_ref(owner)
            .cp()
            .resolve_method(idx, method_id, interface);
        Ok(method_id)
    }

    /// Resolves the array class whose elements are `elem`, building the
    /// array name from the element name.
    pub fn resolve_array_of(
        &mut self,
        ctx: &LoaderCtx<'_>,
        orig: ClassId,
        elem: ClassId,
    ) -> Result<ClassId, VmError> {
        let elem_name = self.names.resolve(&self.get_ref(elem).name).to_owned();
        let array_name = if elem_name.starts_with('[') {
            format!("[{}", elem_name)
        } else {
            format!("[L{};", elem_name)
        };
        let array_sym = self.names.intern_str(&array_name);
        self.resolve(ctx, Some(orig), array_sym)
    }

    /// Subtype test used by checkcast, instanceof, array stores and the
    /// exception handler matcher.
    pub fn is_assignable(&self, src: ClassId, dest: ClassId) -> bool {
        if src == dest {
            return true;
        }

        let src_class = self.get_ref(src);
        let dest_class = self.get_ref(dest);

        if let Some(src_info) = src_class.derived().array.as_ref() {
            return match dest_class.derived().array.as_ref() {
                Some(dest_info) => match (src_info.element, dest_info.element) {
                    (ArrayElement::Primitive(a), ArrayElement::Primitive(b)) => a == b,
                    (ArrayElement::Reference(a), ArrayElement::Reference(b)) => {
                        self.is_assignable(a, b)
                    }
                    _ => false,
                },
                None => self.names.resolve(&dest_class.name) == "java/lang/Object",
            };
        }

        let mut cur = src_class.parent();
        while let Some(id) = cur {
            if id == dest {
                return true;
            }
            cur = self.get_ref(id).parent();
        }

        dest_class.is_interface() && src_class.interfaces().contains(&dest)
    }
}

/// Places the instance fields of a class into the packed layout bands:
/// references grow the negative slab, scalars pack past the header in
/// decreasing alignment order, booleans are bit-packed eight per byte.
fn layout_fields(
    fields: &[Field],
    parent: InstanceLayout,
    class_name: &str,
) -> Result<InstanceLayout, VmError> {
    let header_bytes = (HEADER_WORDS * WORD) as u32;

    let mut ref_n = 0u32;
    let mut bit_count = 0u32;
    let mut byte_size = 0u32;
    let mut short_size = 0u32;
    let mut int_size = 0u32;
    let mut long_size = 0u32;

    for field in fields.iter().filter(|field| !field.is_static()) {
        match field.kind {
            FieldKind::Reference => ref_n += 1,
            FieldKind::Byte => byte_size += 1,
            FieldKind::Bool => bit_count += 1,
            FieldKind::Char | FieldKind::Short => short_size += 2,
            FieldKind::Int | FieldKind::Float => int_size += 4,
            FieldKind::Long | FieldKind::Double => long_size += 8,
        }
    }

    // Round the inherited scalar area up to the strictest alignment this
    // class introduces.
    let mut par_nref_size = parent.nref_size;
    if long_size != 0 {
        par_nref_size = par_nref_size.div_ceil(WORD as u32) * WORD as u32;
    } else if int_size != 0 {
        par_nref_size = par_nref_size.div_ceil(4) * 4;
    } else if short_size != 0 {
        par_nref_size = par_nref_size.div_ceil(2) * 2;
    }

    let new_ref_n = parent.ref_n + ref_n;
    let new_nref_size =
        par_nref_size + long_size + int_size + short_size + byte_size + bit_count.div_ceil(8);

    if new_nref_size > 32767 - header_bytes {
        return Err(VmError::NoClassDefFound(
            "number of non-reference fields exceeds the VM limits".to_string(),
        ));
    }
    if new_ref_n * WORD as u32 > 32768 {
        return Err(VmError::NoClassDefFound(
            "number of reference fields exceeds the VM limits".to_string(),
        ));
    }

    let mut ref_offset = parent.ref_n;
    let mut long_offset = par_nref_size + header_bytes;
    let mut int_offset = long_offset + long_size;
    let mut short_offset = int_offset + int_size;
    let mut byte_offset = short_offset + short_size;
    let mut bit_offset = (byte_offset + byte_size) * 8;

    for field in fields.iter().filter(|field| !field.is_static()) {
        match field.kind {
            FieldKind::Reference => {
                field.set_offset(-(((ref_offset + 1) * WORD as u32) as i32));
                ref_offset += 1;
            }
            FieldKind::Byte => {
                field.set_offset(byte_offset as i32);
                byte_offset += 1;
            }
            FieldKind::Bool => {
                field.set_offset(bit_offset as i32);
                bit_offset += 1;
            }
            FieldKind::Char | FieldKind::Short => {
                field.set_offset(short_offset as i32);
                short_offset += 2;
            }
            FieldKind::Int | FieldKind::Float => {
                field.set_offset(int_offset as i32);
                int_offset += 4;
            }
            FieldKind::Long | FieldKind::Double => {
                field.set_offset(long_offset as i32);
                long_offset += 8;
            }
        }
    }

    let _ = long_offset;

    if bit_offset > 32767 {
        return Err(VmError::NoClassDefFound(
            "number of bit-sized fields exceeds the VM limits".to_string(),
        ));
    }

    // java.lang.ref.Reference needs manual patching: its referent lives
    // right past the header with no reference slot, so the collector can
    // treat it specially.
    if class_name == "java/lang/ref/Reference" {
        let referent = fields
            .iter()
            .find(|field| !field.is_static())
            .expect("Reference declares the referent field");
        referent.set_offset(header_bytes as i32);
        return Ok(InstanceLayout {
            ref_n: 0,
            nref_size: WORD as u32,
        });
    }

    Ok(InstanceLayout {
        ref_n: new_ref_n,
        nref_size: new_nref_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::flags::FieldFlags;

    fn field(pool: &Utf8Pool, name: &str, desc: &str, flags: u16) -> Field {
        Field::new(
            pool.intern_str(name),
            pool.intern_str(desc),
            FieldFlags::from_raw(flags),
            FieldKind::from_descriptor(desc).unwrap(),
            None,
        )
    }

    #[test]
    fn layout_packs_bands_in_decreasing_alignment() {
        let pool = Utf8Pool::new();
        let fields = vec![
            field(&pool, "next", "Ljava/lang/Object;", 0),
            field(&pool, "flag", "Z", 0),
            field(&pool, "count", "I", 0),
            field(&pool, "ticks", "J", 0),
            field(&pool, "tag", "B", 0),
            field(&pool, "unit", "S", 0),
        ];

        let layout = layout_fields(&fields, InstanceLayout::default(), "demo/Node").unwrap();

        assert_eq!(layout.ref_n, 1);
        // 8 (long) + 4 (int) + 2 (short) + 1 (byte) + 1 (bit byte)
        assert_eq!(layout.nref_size, 16);

        assert_eq!(fields[0].offset(), -(WORD as i32));
        assert_eq!(fields[3].offset(), 8); // long right past the header
        assert_eq!(fields[2].offset(), 16); // int band
        assert_eq!(fields[5].offset(), 20); // short band
        assert_eq!(fields[4].offset(), 22); // byte band
        assert_eq!(fields[1].offset(), 23 * 8); // bit index into the bit band
    }

    #[test]
    fn layout_inherits_the_parent_bands() {
        let pool = Utf8Pool::new();
        let fields = vec![field(&pool, "x", "I", 0)];
        let parent = InstanceLayout {
            ref_n: 2,
            nref_size: 5,
        };

        let layout = layout_fields(&fields, parent, "demo/Child").unwrap();
        assert_eq!(layout.ref_n, 2);
        // parent scalar area realigned to 4, then one int
        assert_eq!(layout.nref_size, 12);
        assert_eq!(fields[0].offset(), 8 + 8); // header + realigned parent area
    }

    #[test]
    fn layout_rejects_oversized_bit_bands() {
        let pool = Utf8Pool::new();
        let fields: Vec<Field> = (0..4100)
            .map(|i| field(&pool, &format!("b{}", i), "Z", 0))
            .collect();
        // 4100 bits still fit; the limit is on the final bit index.
        assert!(layout_fields(&fields, InstanceLayout::default(), "demo/Bits").is_ok());

        let parent = InstanceLayout {
            ref_n: 0,
            nref_size: 32000,
        };
        assert!(matches!(
            layout_fields(&fields, parent, "demo/Bits"),
            Err(VmError::NoClassDefFound(_))
        ));
    }
}
