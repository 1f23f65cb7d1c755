//! Traversal of the target's reflection registry.
//!
//! The registry is a chain of foreign-memory structures: the schema system
//! root holds a vector of per-module type scopes, each scope a hash table of
//! declared-class bindings, each binding an array of field descriptors. The
//! walk dereferences that chain through the offsets in [`layout`] and
//! degrades on any failed read; only a missing or implausible root is an
//! error.

pub mod layout;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::{Address, ReadMemory};
use crate::scan::{Pattern, find_pattern, resolve_rip_relative};

/// Module hosting the schema system.
pub const SCHEMA_SYSTEM_MODULE: &str = "schemasystem.dll";

/// Signature of the registry accessor: `LEA rcx, [rip+disp32]` loading the
/// schema system singleton, followed by the call that returns it.
pub const SCHEMA_SYSTEM_PATTERN: &str = "48 8D 0D ? ? ? ? E8 ? ? ? ? 48 83 C4 28 C3";

/// A declared field: name and byte offset within its class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassField {
    pub name: String,
    pub offset: u32,
}

/// The schema system root.
pub struct SchemaSystem<'a, R: ReadMemory + ?Sized> {
    reader: &'a R,
    address: u64,
}

impl<'a, R: ReadMemory + ?Sized> SchemaSystem<'a, R> {
    pub fn new(reader: &'a R, address: u64) -> Self {
        Self { reader, address }
    }

    /// Locate the registry root inside the schema module mapped at
    /// `module_base`: signature scan, then RIP resolution. `Ok(None)` when
    /// the signature does not match this build.
    pub fn locate(reader: &'a R, module_base: u64) -> Result<Option<Self>> {
        let pattern = Pattern::parse(SCHEMA_SYSTEM_PATTERN)?;
        let Some(site) = find_pattern(reader, module_base, &pattern)? else {
            return Ok(None);
        };
        Ok(resolve_rip_relative(reader, site).map(|address| Self::new(reader, address)))
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Every registered type scope, in registry order.
    pub fn type_scopes(&self) -> Result<Vec<TypeScope<'a, R>>> {
        let count = self
            .reader
            .read_i32(self.address + layout::system::TYPE_SCOPE_COUNT)
            .map_err(|_| Error::schema_walk_failed("type scope vector is unreadable"))?;
        if count <= 0 || count > layout::system::MAX_TYPE_SCOPES {
            return Err(Error::schema_walk_failed(format!(
                "implausible type scope count {count}"
            )));
        }

        let data = self
            .reader
            .read_u64(self.address + layout::system::TYPE_SCOPE_DATA)
            .map_err(|_| Error::schema_walk_failed("type scope vector is unreadable"))?;
        if data == 0 {
            return Err(Error::schema_walk_failed("type scope vector is null"));
        }

        let mut scopes = Vec::with_capacity(count as usize);
        for i in 0..count as u64 {
            let scope = self.reader.read_u64(data + i * 8).unwrap_or(0);
            if scope == 0 {
                continue;
            }
            scopes.push(TypeScope::new(self.reader, Address::new(scope)));
        }

        debug!("schema system holds {} type scopes", scopes.len());
        Ok(scopes)
    }
}

/// A per-module type scope.
pub struct TypeScope<'a, R: ReadMemory + ?Sized> {
    reader: &'a R,
    address: Address,
    module_name: String,
}

impl<'a, R: ReadMemory + ?Sized> TypeScope<'a, R> {
    fn new(reader: &'a R, address: Address) -> Self {
        let module_name = reader.read_string(
            (address + layout::scope::MODULE_NAME).value(),
            layout::scope::MODULE_NAME_LEN,
        );
        Self {
            reader,
            address,
            module_name,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Walk the scope's class-binding hash: every bucket chain, collecting
    /// each node's data pointer. Failed reads end the affected chain; a
    /// chain past the length cap is dropped with a warning.
    pub fn class_bindings(&self) -> Vec<ClassBinding<'a, R>> {
        let buckets = self.address + layout::scope::CLASS_BINDINGS + layout::hash::POOL_PREFIX;
        let mut bindings = Vec::new();

        for bucket in 0..layout::hash::BUCKET_COUNT {
            let head = buckets + bucket * layout::hash::BUCKET_STRIDE + layout::hash::BUCKET_FIRST;
            let mut node = self.reader.read_u64(head.value()).unwrap_or(0);
            let mut followed = 0usize;

            while node != 0 {
                if followed >= layout::hash::MAX_CHAIN {
                    warn!(
                        "{}: bucket {bucket} chain exceeded {} nodes, dropping it",
                        self.module_name,
                        layout::hash::MAX_CHAIN
                    );
                    break;
                }
                followed += 1;

                let data = self
                    .reader
                    .read_u64(node + layout::hash::NODE_DATA)
                    .unwrap_or(0);
                if data != 0 {
                    let binding = ClassBinding::new(self.reader, Address::new(data));
                    if !binding.name().is_empty() {
                        bindings.push(binding);
                    }
                }

                node = self
                    .reader
                    .read_u64(node + layout::hash::NODE_NEXT)
                    .unwrap_or(0);
            }
        }

        bindings
    }
}

/// A declared class registered in a type scope.
pub struct ClassBinding<'a, R: ReadMemory + ?Sized> {
    reader: &'a R,
    address: Address,
    name: String,
}

impl<'a, R: ReadMemory + ?Sized> ClassBinding<'a, R> {
    fn new(reader: &'a R, address: Address) -> Self {
        let name_ptr = reader
            .read_u64((address + layout::binding::NAME).value())
            .unwrap_or(0);
        let name = if name_ptr == 0 {
            String::new()
        } else {
            reader.read_string(name_ptr, layout::field::NAME_LEN)
        };
        Self {
            reader,
            address,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_count(&self) -> u16 {
        self.reader
            .read_u16((self.address + layout::binding::FIELD_COUNT).value())
            .unwrap_or(0)
    }

    /// The class's declared fields. A field whose name cannot be read is
    /// skipped; a missing offset degrades to 0.
    pub fn fields(&self) -> Vec<ClassField> {
        let count = self.field_count();
        let array = self
            .reader
            .read_u64((self.address + layout::binding::FIELDS).value())
            .unwrap_or(0);
        if array == 0 {
            return Vec::new();
        }

        let mut fields = Vec::with_capacity(count as usize);
        for i in 0..count as u64 {
            let descriptor = array + i * layout::binding::FIELD_STRIDE;
            let name_ptr = self
                .reader
                .read_u64(descriptor + layout::field::NAME)
                .unwrap_or(0);
            if name_ptr == 0 {
                continue;
            }
            let name = self.reader.read_string(name_ptr, layout::field::NAME_LEN);
            if name.is_empty() {
                continue;
            }

            let offset = self
                .reader
                .read_u32(descriptor + layout::field::OFFSET)
                .unwrap_or(0);
            fields.push(ClassField { name, offset });
        }

        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MockMemory, MockMemoryBuilder};

    const BASE: u64 = 0x0002_4000_0000;
    const SYSTEM: u64 = BASE + 0x100;

    /// One scope ("client.dll") with one class ("C_BaseEntity", two fields)
    /// in bucket 0 and one class ("CSkeletonInstance", no fields) in bucket 7.
    fn build_registry() -> MockMemory {
        let mut mock = MockMemoryBuilder::new(BASE, 0x10000);

        // Root: one scope pointer.
        mock.write_i32(SYSTEM + layout::system::TYPE_SCOPE_COUNT, 1);
        mock.write_u64(SYSTEM + layout::system::TYPE_SCOPE_DATA, BASE + 0x400);
        mock.write_u64(BASE + 0x400, BASE + 0x1000);

        // Scope.
        let scope = BASE + 0x1000;
        mock.write_str(scope + layout::scope::MODULE_NAME, "client.dll");

        let buckets = scope + layout::scope::CLASS_BINDINGS + layout::hash::POOL_PREFIX;
        mock.write_u64(buckets + layout::hash::BUCKET_FIRST, BASE + 0x4000);
        mock.write_u64(
            buckets + 7 * layout::hash::BUCKET_STRIDE + layout::hash::BUCKET_FIRST,
            BASE + 0x4040,
        );

        // Bucket 0: single node -> C_BaseEntity.
        mock.write_u64(BASE + 0x4000 + layout::hash::NODE_NEXT, 0);
        mock.write_u64(BASE + 0x4000 + layout::hash::NODE_DATA, BASE + 0x4100);

        // Bucket 7: single node -> CSkeletonInstance.
        mock.write_u64(BASE + 0x4040 + layout::hash::NODE_NEXT, 0);
        mock.write_u64(BASE + 0x4040 + layout::hash::NODE_DATA, BASE + 0x4180);

        // C_BaseEntity with two fields.
        let entity = BASE + 0x4100;
        mock.write_u64(entity + layout::binding::NAME, BASE + 0x4200);
        mock.write_str(BASE + 0x4200, "C_BaseEntity");
        mock.write_u16(entity + layout::binding::FIELD_COUNT, 2);
        mock.write_u64(entity + layout::binding::FIELDS, BASE + 0x4300);

        let fields = BASE + 0x4300;
        mock.write_u64(fields + layout::field::NAME, BASE + 0x4400);
        mock.write_str(BASE + 0x4400, "m_iHealth");
        mock.write_u32(fields + layout::field::OFFSET, 0x32C);
        mock.write_u64(
            fields + layout::binding::FIELD_STRIDE + layout::field::NAME,
            BASE + 0x4420,
        );
        mock.write_str(BASE + 0x4420, "m_vecOrigin");
        mock.write_u32(
            fields + layout::binding::FIELD_STRIDE + layout::field::OFFSET,
            0x88,
        );

        // CSkeletonInstance with a null field array.
        let skeleton = BASE + 0x4180;
        mock.write_u64(skeleton + layout::binding::NAME, BASE + 0x4220);
        mock.write_str(BASE + 0x4220, "CSkeletonInstance");
        mock.write_u16(skeleton + layout::binding::FIELD_COUNT, 5);
        mock.write_u64(skeleton + layout::binding::FIELDS, 0);

        mock.build()
    }

    #[test]
    fn test_type_scopes() {
        let memory = build_registry();
        let system = SchemaSystem::new(&memory, SYSTEM);

        let scopes = system.type_scopes().unwrap();
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].module_name(), "client.dll");
    }

    #[test]
    fn test_class_binding_walk() {
        let memory = build_registry();
        let system = SchemaSystem::new(&memory, SYSTEM);
        let scopes = system.type_scopes().unwrap();

        let mut bindings = scopes[0].class_bindings();
        bindings.sort_by(|a, b| a.name().cmp(b.name()));
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].name(), "CSkeletonInstance");
        assert_eq!(bindings[1].name(), "C_BaseEntity");
    }

    #[test]
    fn test_fields_of_declared_class() {
        let memory = build_registry();
        let system = SchemaSystem::new(&memory, SYSTEM);
        let scopes = system.type_scopes().unwrap();
        let bindings = scopes[0].class_bindings();

        let entity = bindings
            .iter()
            .find(|binding| binding.name() == "C_BaseEntity")
            .unwrap();
        assert_eq!(entity.field_count(), 2);
        assert_eq!(
            entity.fields(),
            vec![
                ClassField {
                    name: "m_iHealth".to_string(),
                    offset: 0x32C,
                },
                ClassField {
                    name: "m_vecOrigin".to_string(),
                    offset: 0x88,
                },
            ]
        );
    }

    #[test]
    fn test_null_field_array_degrades_to_empty() {
        let memory = build_registry();
        let system = SchemaSystem::new(&memory, SYSTEM);
        let scopes = system.type_scopes().unwrap();
        let bindings = scopes[0].class_bindings();

        let skeleton = bindings
            .iter()
            .find(|binding| binding.name() == "CSkeletonInstance")
            .unwrap();
        assert_eq!(skeleton.field_count(), 5);
        assert!(skeleton.fields().is_empty());
    }

    #[test]
    fn test_implausible_root_is_an_error() {
        let mut mock = MockMemoryBuilder::new(BASE, 0x1000);
        mock.write_i32(BASE + layout::system::TYPE_SCOPE_COUNT, 0x7FFF_FFFF);
        let memory = mock.build();

        let system = SchemaSystem::new(&memory, BASE);
        assert!(system.type_scopes().is_err());
    }
}
