//! Field offsets for the schema registry walk.
//!
//! The walk is data-driven: every dereference below goes through one of
//! these constants, so a target update that shifts a structure is a
//! one-line change here. Values are pinned to the current target build.

/// Schema system root object.
pub mod system {
    /// Length of the type-scope pointer vector (i32).
    pub const TYPE_SCOPE_COUNT: u64 = 0x188;
    /// Element storage of the type-scope pointer vector.
    pub const TYPE_SCOPE_DATA: u64 = 0x190;

    /// Sanity cap on the scope count; a value past this means the root
    /// pointer is wrong.
    pub const MAX_TYPE_SCOPES: i32 = 0x100;
}

/// Per-module type scope.
pub mod scope {
    /// Inline module name buffer (NUL-terminated).
    pub const MODULE_NAME: u64 = 0x8;
    pub const MODULE_NAME_LEN: usize = 256;

    /// Class-binding hash table.
    pub const CLASS_BINDINGS: u64 = 0x558;
}

/// Geometry of the class-binding hash table: a memory-pool header followed
/// by fixed-count buckets, each heading a chain of nodes.
pub mod hash {
    /// Bytes of pool bookkeeping before the bucket array.
    pub const POOL_PREFIX: u64 = 0x80;

    pub const BUCKET_COUNT: u64 = 256;
    pub const BUCKET_STRIDE: u64 = 0x28;
    /// Head of the bucket's node chain (uncommitted insertions included).
    pub const BUCKET_FIRST: u64 = 0x20;

    /// Chain node links.
    pub const NODE_NEXT: u64 = 0x8;
    pub const NODE_DATA: u64 = 0x10;

    /// Upper bound on nodes followed per bucket; a chain longer than this is
    /// a corrupt or mis-addressed table.
    pub const MAX_CHAIN: usize = 0x1000;
}

/// Declared-class binding.
pub mod binding {
    /// Class name (pointer to NUL-terminated string).
    pub const NAME: u64 = 0x8;
    /// Declared field count (u16).
    pub const FIELD_COUNT: u64 = 0x1C;
    /// Field descriptor array (pointer).
    pub const FIELDS: u64 = 0x28;
    /// Size of one field descriptor.
    pub const FIELD_STRIDE: u64 = 0x20;
}

/// Field descriptor.
pub mod field {
    /// Field name (pointer to NUL-terminated string).
    pub const NAME: u64 = 0x0;
    /// Byte offset of the field within its class (u32).
    pub const OFFSET: u64 = 0x10;

    pub const NAME_LEN: usize = 256;
}
