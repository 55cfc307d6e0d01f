//! Running one ioctl request end to end: header, lookup, parse, handler, commit.

use thiserror::Error;
use tracing::{debug, trace_span};
use uverbs_memory::{UserMemory, UserMemoryError};

use crate::bundle::AccessError;
use crate::errno;
use crate::parse::{parse_bundle, ParseError, ParseOptions};
use crate::registry::ObjectRegistry;
use crate::tree::SpecTree;
use crate::wire::{IoctlHeader, UserAttrs};

/// Per-file state a request runs against.
pub trait UverbsSession {
    /// Memory of the process that issued the request.
    fn user_memory(&mut self) -> &mut dyn UserMemory;

    /// Objects owned by the session's root context.
    fn objects(&mut self) -> &mut dyn ObjectRegistry;

    /// Whether a root context has been established on this session.
    fn has_context(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub parse: ParseOptions,
}

/// Failure reported by a method handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("invalid request: {0}")]
    Invalid(&'static str),

    /// Handler-specific errno, positive or already negated.
    #[error("handler failed with errno {0}")]
    Errno(i32),
}

impl HandlerError {
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Access(err) => err.to_errno(),
            Self::Invalid(_) => -errno::EINVAL,
            Self::Errno(code) if *code > 0 => -code,
            Self::Errno(code) => *code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("invalid ioctl header: {0}")]
    InvalidHeader(&'static str),

    #[error("unknown object {object:#06x}")]
    UnknownObject { object: u16 },

    #[error("unknown method {method:#06x} of object {object:#06x}")]
    UnknownMethod { object: u16, method: u16 },

    #[error("method {method:#06x} of object {object:#06x} has no handler")]
    NotSupported { object: u16, method: u16 },

    #[error("session has no root context")]
    NoContext,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Fault(#[from] UserMemoryError),
}

impl DispatchError {
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::InvalidHeader(_) | Self::NoContext => -errno::EINVAL,
            Self::UnknownObject { .. } | Self::UnknownMethod { .. } => -errno::EPROTONOSUPPORT,
            Self::NotSupported { .. } => -errno::EOPNOTSUPP,
            Self::Parse(err) => err.to_errno(),
            Self::Handler(err) => err.to_errno(),
            Self::Fault(_) => -errno::EFAULT,
        }
    }
}

impl<D, S: UverbsSession> SpecTree<D, S> {
    /// Executes the request whose header sits at `ioctl_addr` in the session's user memory.
    ///
    /// Objects referenced by the request are committed only if the handler succeeds; ids of
    /// created objects are written back to the sender's records at that point. On any failure
    /// every resolved object is aborted.
    pub fn dispatch(
        &self,
        device: &D,
        session: &mut S,
        ioctl_addr: u64,
        options: &DispatchOptions,
    ) -> Result<(), DispatchError> {
        let header = IoctlHeader::read_from(session.user_memory(), ioctl_addr)?;
        let span = trace_span!(
            "uverbs_ioctl",
            object = header.object_id,
            method = header.method_id,
            num_attrs = header.num_attrs
        );
        let _guard = span.enter();

        let num_attrs = usize::from(header.num_attrs);
        if num_attrs > options.parse.max_attrs {
            return Err(ParseError::TooManyAttributes {
                count: num_attrs,
                max: options.parse.max_attrs,
            }
            .into());
        }
        header
            .validate(options.parse.max_attrs)
            .map_err(DispatchError::InvalidHeader)?;

        let (object, method) = (header.object_id, header.method_id);
        if self.object(object).is_none() {
            return Err(DispatchError::UnknownObject { object });
        }
        let spec = self
            .method(object, method)
            .ok_or(DispatchError::UnknownMethod { object, method })?;
        let handler = spec
            .handler()
            .ok_or(DispatchError::NotSupported { object, method })?;
        let has_context = session.has_context();
        if !spec.creates_root() && !has_context {
            return Err(DispatchError::NoContext);
        }

        let records_addr = ioctl_addr
            .checked_add(IoctlHeader::SIZE_BYTES as u64)
            .ok_or(UserMemoryError::Fault {
                addr: ioctl_addr,
                len: usize::from(header.length),
            })?;
        let attrs = UserAttrs::read(session.user_memory(), records_addr, num_attrs)?;

        let objects = if has_context {
            Some(session.objects())
        } else {
            None
        };
        let bundle = parse_bundle(self, object, method, &attrs, objects, &options.parse)?;

        if let Err(err) = handler(device, session, &bundle) {
            debug!(error = %err, "handler failed");
            bundle.abort(session.objects());
            return Err(err.into());
        }

        if let Err(err) = bundle.write_created_ids(session.user_memory()) {
            bundle.abort(session.objects());
            return Err(err.into());
        }
        bundle.commit(session.objects());
        Ok(())
    }
}
