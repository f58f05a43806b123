//! RPC (Remote Procedure Call) request encoding.
//!
//! RPC requests (packet type 0x03) run system procedures by id. The engine
//! uses four of them: `sp_executesql` for one-shot parameterized commands,
//! `sp_prepexec` to prepare and run a statement in one round trip,
//! `sp_execute` to run an already prepared statement, and `sp_unprepare` to
//! release a prepared handle.
//!
//! ## Wire Format
//!
//! ```text
//! +-------------------+
//! | ALL_HEADERS       |
//! +-------------------+
//! | 0xFFFF + ProcID   |  (or US_VARCHAR procedure name)
//! +-------------------+
//! | Option Flags      |  (2 bytes)
//! +-------------------+
//! | Parameters        |  (name, status, TYPE_INFO, value)
//! +-------------------+
//! ```

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};

use crate::sql_batch::write_all_headers;
use crate::token::{write_value, TypeInfo};
use crate::types::{LengthKind, TypeId};
use crate::writer::BufferWriter;

/// Well-known stored procedure IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_executesql
    ExecuteSql = 0x000A,
    /// sp_prepare
    Prepare = 0x000B,
    /// sp_execute
    Execute = 0x000C,
    /// sp_prepexec
    PrepExec = 0x000D,
    /// sp_unprepare
    Unprepare = 0x000F,
}

bitflags! {
    /// RPC option flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RpcOptionFlags: u16 {
        /// Recompile the procedure.
        const WITH_RECOMPILE = 0x0001;
        /// No metadata in response.
        const NO_METADATA = 0x0002;
        /// Reuse metadata from the previous call.
        const REUSE_METADATA = 0x0004;
    }
}

bitflags! {
    /// RPC parameter status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParamFlags: u8 {
        /// Output parameter.
        const BY_REF = 0x01;
        /// Use the parameter's default value.
        const DEFAULT = 0x02;
    }
}

/// An RPC parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcParam {
    /// Parameter name (empty for positional parameters). Written as a
    /// `B_VARCHAR`, so longer than 255 UTF-16 code units is truncated.
    pub name: String,
    /// Status flags.
    pub flags: ParamFlags,
    /// Type information.
    pub type_info: TypeInfo,
    /// Value bytes without length prefix; `None` is NULL.
    pub value: Option<Bytes>,
}

impl RpcParam {
    /// Create a parameter with a value.
    pub fn new(name: impl Into<String>, type_info: TypeInfo, value: Option<Bytes>) -> Self {
        Self {
            name: name.into(),
            flags: ParamFlags::empty(),
            type_info,
            value,
        }
    }

    /// Create an INT parameter.
    pub fn int(name: impl Into<String>, value: i32) -> Self {
        Self::new(
            name,
            TypeInfo::nullable(TypeId::IntN, 4),
            Some(Bytes::copy_from_slice(&value.to_le_bytes())),
        )
    }

    /// Create an NVARCHAR parameter sized for the value.
    pub fn nvarchar(name: impl Into<String>, value: &str) -> Self {
        let mut buf = BytesMut::with_capacity(value.len() * 2);
        buf.write_utf16(value);
        let type_info = nvarchar_type_for(buf.len());
        Self::new(name, type_info, Some(buf.freeze()))
    }

    /// Mark as output parameter.
    #[must_use]
    pub fn as_output(mut self) -> Self {
        self.flags |= ParamFlags::BY_REF;
        self
    }

    /// Write the parameter.
    pub fn write(&self, dst: &mut (impl BufferWriter + ?Sized)) {
        dst.write_b_varchar(&self.name);
        dst.write_u8(self.flags.bits());
        self.type_info.encode(dst);
        write_value(dst, self.type_info.length_kind, self.value.as_deref());
    }

    /// SQL type name used in `sp_executesql` / `sp_prepexec` declarations.
    #[must_use]
    pub fn sql_type_name(&self) -> String {
        let info = &self.type_info;
        match (info.type_id, info.max_length) {
            (TypeId::IntN, Some(1)) => "tinyint".into(),
            (TypeId::IntN, Some(2)) => "smallint".into(),
            (TypeId::IntN, Some(8)) => "bigint".into(),
            (TypeId::IntN, _) => "int".into(),
            (TypeId::BitN, _) => "bit".into(),
            (TypeId::FloatN, Some(4)) => "real".into(),
            (TypeId::FloatN, _) => "float".into(),
            (TypeId::NVarChar, _) if info.length_kind == LengthKind::Plp => "nvarchar(max)".into(),
            (TypeId::NVarChar, len) => format!("nvarchar({})", len.unwrap_or(8000) / 2),
            (TypeId::BigVarBinary, _) if info.length_kind == LengthKind::Plp => {
                "varbinary(max)".into()
            }
            (TypeId::BigVarBinary, len) => format!("varbinary({})", len.unwrap_or(8000)),
            _ => "sql_variant".into(),
        }
    }
}

/// Largest non-`(max)` NVARCHAR in bytes.
pub const NVARCHAR_MAX_INLINE: usize = 8000;

/// NVARCHAR descriptor for a UTF-16 value of `byte_len` bytes.
///
/// Values up to 4000 characters use `NVARCHAR(4000)`; longer ones use
/// `NVARCHAR(MAX)`.
#[must_use]
pub fn nvarchar_type_for(byte_len: usize) -> TypeInfo {
    if byte_len > NVARCHAR_MAX_INLINE {
        TypeInfo::nvarchar(0xFFFF)
    } else {
        TypeInfo::nvarchar(NVARCHAR_MAX_INLINE as u16)
    }
}

/// Procedure reference in an RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Procedure {
    Id(ProcId),
    Name(String),
}

/// RPC request builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    procedure: Procedure,
    options: RpcOptionFlags,
    params: Vec<RpcParam>,
    transaction_descriptor: u64,
}

impl RpcRequest {
    /// Create a request for a well-known procedure.
    #[must_use]
    pub fn by_id(proc_id: ProcId) -> Self {
        Self {
            procedure: Procedure::Id(proc_id),
            options: RpcOptionFlags::empty(),
            params: Vec::new(),
            transaction_descriptor: 0,
        }
    }

    /// Create a request for a named procedure.
    pub fn named(proc_name: impl Into<String>) -> Self {
        Self {
            procedure: Procedure::Name(proc_name.into()),
            ..Self::by_id(ProcId::ExecuteSql)
        }
    }

    /// `sp_executesql`: run `sql` once with `params`.
    #[must_use]
    pub fn execute_sql(sql: &str, params: Vec<RpcParam>) -> Self {
        let mut request = Self::by_id(ProcId::ExecuteSql);
        request.params.push(RpcParam::nvarchar("", sql));
        if !params.is_empty() {
            request
                .params
                .push(RpcParam::nvarchar("", &param_declarations(&params)));
        }
        request.params.extend(params);
        request
    }

    /// `sp_prepexec`: prepare `sql`, run it, and return the handle through
    /// the first (output) parameter.
    #[must_use]
    pub fn prep_exec(sql: &str, params: Vec<RpcParam>) -> Self {
        let mut request = Self::by_id(ProcId::PrepExec);
        request.params.push(
            RpcParam::new("@handle", TypeInfo::nullable(TypeId::IntN, 4), None).as_output(),
        );
        request
            .params
            .push(RpcParam::nvarchar("@params", &param_declarations(&params)));
        request.params.push(RpcParam::nvarchar("@stmt", sql));
        request.params.extend(params);
        request
    }

    /// `sp_execute`: run a prepared statement.
    #[must_use]
    pub fn execute(handle: i32, params: Vec<RpcParam>) -> Self {
        let mut request = Self::by_id(ProcId::Execute);
        request.params.push(RpcParam::int("@handle", handle));
        request.params.extend(params);
        request
    }

    /// `sp_unprepare`: release a prepared statement.
    #[must_use]
    pub fn unprepare(handle: i32) -> Self {
        let mut request = Self::by_id(ProcId::Unprepare);
        request.params.push(RpcParam::int("@handle", handle));
        request
    }

    /// Set option flags.
    #[must_use]
    pub fn with_options(mut self, options: RpcOptionFlags) -> Self {
        self.options = options;
        self
    }

    /// Run inside the given transaction.
    #[must_use]
    pub fn with_transaction(mut self, descriptor: u64) -> Self {
        self.transaction_descriptor = descriptor;
        self
    }

    /// Add a parameter.
    #[must_use]
    pub fn param(mut self, param: RpcParam) -> Self {
        self.params.push(param);
        self
    }

    /// The well-known procedure id, if any.
    #[must_use]
    pub fn proc_id(&self) -> Option<ProcId> {
        match self.procedure {
            Procedure::Id(id) => Some(id),
            Procedure::Name(_) => None,
        }
    }

    /// Parameters in wire order.
    #[must_use]
    pub fn params(&self) -> &[RpcParam] {
        &self.params
    }

    /// Write the payload.
    pub fn write_body(&self, dst: &mut (impl BufferWriter + ?Sized)) {
        write_all_headers(dst, self.transaction_descriptor);

        match &self.procedure {
            Procedure::Id(id) => {
                dst.write_u16_le(0xFFFF);
                dst.write_u16_le(*id as u16);
            }
            Procedure::Name(name) => dst.write_us_varchar(name),
        }

        dst.write_u16_le(self.options.bits());

        for param in &self.params {
            param.write(dst);
        }
    }

    /// Encode the payload into a new buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        self.write_body(&mut buf);
        buf.freeze()
    }
}

/// Build the declaration list (`@p1 int, @p2 nvarchar(4000)`).
///
/// Unnamed parameters are declared positionally as `@p1`, `@p2`, ...
#[must_use]
pub fn param_declarations(params: &[RpcParam]) -> String {
    params
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let name = if p.name.is_empty() {
                format!("@p{}", i + 1)
            } else if p.name.starts_with('@') {
                p.name.clone()
            } else {
                format!("@{}", p.name)
            };
            let output = if p.flags.contains(ParamFlags::BY_REF) {
                " output"
            } else {
                ""
            };
            format!("{name} {}{output}", p.sql_type_name())
        })
        .collect::<Vec<_>>()
        .join(", ")
}
