/// Query-path collaboration.
///
/// `OpQuery` messages may need rewriting or interception to keep the proxy
/// transparent (the `getLastError` idiom in particular), so they are
/// delegated to a [`QueryProxy`] collaborator. The core only ever checks
/// and clears the per-session [`LastError`] cache; populating it is the
/// collaborator's business.
use async_trait::async_trait;
use bytes::Bytes;

use crate::conn::AsyncReadWrite;
use crate::error::ProxyResult;
use crate::wire::{self, MessageHeader};

/// Per-session cache of the context a `getLastError` reply would need.
/// Never shared across sessions.
#[derive(Default)]
pub struct LastError {
    header: Option<MessageHeader>,
    body: Option<Bytes>,
}

impl LastError {
    /// Whether a `getLastError` context is pending.
    pub fn exists(&self) -> bool {
        self.header.is_some()
    }

    /// Drop the pending context. Called by the core on any non-query op.
    pub fn reset(&mut self) {
        self.header = None;
        self.body = None;
    }

    /// Populate the cache. Reserved for [`QueryProxy`] implementations.
    pub fn set(&mut self, header: MessageHeader, body: Bytes) {
        self.header = Some(header);
        self.body = Some(body);
    }

    /// The cached context, if any. A rewriting collaborator answers a
    /// repeated `getLastError` from here.
    pub fn get(&self) -> Option<(&MessageHeader, &Bytes)> {
        match (&self.header, &self.body) {
            (Some(header), Some(body)) => Some((header, body)),
            _ => None,
        }
    }
}

/// Handles one `OpQuery` exchange. Implementations must honor message
/// framing and are the only party allowed to mutate [`LastError`].
///
/// A rewriting collaborator answers a repeated `getLastError` from the
/// session cache instead of a server round trip:
///
/// ```
/// use async_trait::async_trait;
/// use portero::conn::AsyncReadWrite;
/// use portero::wire::{self, MessageHeader};
/// use portero::{LastError, ProxyResult, QueryProxy, TransparentQueryProxy};
/// use tokio::io::AsyncWriteExt;
///
/// struct CachingQueryProxy;
///
/// #[async_trait]
/// impl QueryProxy for CachingQueryProxy {
///     async fn proxy(
///         &self,
///         header: &MessageHeader,
///         client: &mut (dyn AsyncReadWrite),
///         server: &mut (dyn AsyncReadWrite),
///         last_error: &mut LastError,
///     ) -> ProxyResult<()> {
///         if let Some((reply, body)) = last_error.get() {
///             let mut replay = *reply;
///             replay.response_to = header.request_id;
///             wire::copy_exact(client, &mut tokio::io::sink(), header.body_length()).await?;
///             wire::write_header(client, &replay).await?;
///             client.write_all(body).await?;
///             return Ok(());
///         }
///         TransparentQueryProxy.proxy(header, client, server, last_error).await
///     }
/// }
/// ```
#[async_trait]
pub trait QueryProxy: Send + Sync {
    async fn proxy(
        &self,
        header: &MessageHeader,
        client: &mut (dyn AsyncReadWrite),
        server: &mut (dyn AsyncReadWrite),
        last_error: &mut LastError,
    ) -> ProxyResult<()>;
}

/// Forwards queries byte-for-byte without inspection. The default when no
/// rewriting collaborator is installed.
pub struct TransparentQueryProxy;

#[async_trait]
impl QueryProxy for TransparentQueryProxy {
    async fn proxy(
        &self,
        header: &MessageHeader,
        client: &mut (dyn AsyncReadWrite),
        server: &mut (dyn AsyncReadWrite),
        _last_error: &mut LastError,
    ) -> ProxyResult<()> {
        wire::write_header(server, header).await?;
        wire::copy_exact(client, server, header.body_length()).await?;
        if header.op_code.has_response() {
            wire::copy_message(server, client).await?;
        }
        Ok(())
    }
}
