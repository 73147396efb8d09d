//! Seekable byte sources.

use bytes::Bytes;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncSeek, AsyncSeekExt, AsyncWriteExt},
};

/// Anything an upload or an analyzer can read from and rewind.
pub trait Source: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> Source for T {}

/// Copies a forward-only reader into an anonymous temp file so it can be
/// rewound. The returned file is positioned at offset 0.
pub async fn spool<R>(reader: &mut R) -> std::io::Result<File>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = File::from_std(tempfile::tempfile()?);
    tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    file.rewind().await?;
    Ok(file)
}

/// Writes `data` into an anonymous temp file positioned at offset 0.
pub async fn materialize(data: &Bytes) -> std::io::Result<File> {
    let mut file = File::from_std(tempfile::tempfile()?);
    file.write_all(data).await?;
    file.flush().await?;
    file.rewind().await?;
    Ok(file)
}
