use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{Cache, ProxyCache, Result, Source, SourceStream};

/// Streams the resource from `offset` through the engine's blocking read.
pub(crate) async fn write_cached<S, C, W>(
    proxy: &ProxyCache<S, C>,
    out: &mut W,
    mut offset: u64,
    buffer_size: usize,
) -> Result<u64>
where
    S: Source,
    C: Cache,
    W: AsyncWrite + Unpin + Send,
{
    let mut buffer = allocate_buffer(buffer_size);
    let mut written = 0;
    loop {
        let n = proxy.read(&mut buffer, offset).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n]).await?;
        offset += n as u64;
        written += n as u64;
    }
    out.flush().await?;
    Ok(written)
}

/// Streams an opened source straight to `out`, bypassing the cache.
pub(crate) async fn write_uncached<T, W>(stream: &mut T, out: &mut W) -> Result<u64>
where
    T: SourceStream,
    W: AsyncWrite + Unpin + Send,
{
    let mut written = 0;
    while let Some(chunk) = stream.read().await? {
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    out.flush().await?;
    Ok(written)
}

fn allocate_buffer(size: usize) -> BytesMut {
    BytesMut::zeroed(size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryCache, MemorySource};

    #[tokio::test]
    async fn test_write_cached_from_offset() {
        let proxy = ProxyCache::new(MemorySource::new(&b"0123456789ABCDEF"[..]), MemoryCache::new());
        let mut out = Vec::new();
        assert_eq!(6, write_cached(&proxy, &mut out, 10, 4).await.unwrap());
        assert_eq!(b"ABCDEF".to_vec(), out);
    }

    #[tokio::test]
    async fn test_write_uncached() {
        let source = MemorySource::new(&b"0123456789"[..]).with_chunk_size(3);
        let mut stream = source.open(4).await.unwrap();
        let mut out = Vec::new();
        assert_eq!(6, write_uncached(&mut stream, &mut out).await.unwrap());
        assert_eq!(b"456789".to_vec(), out);
    }
}
