//! Minimal SCP sink framing.
//!
//! A single file is sent to a remote `scp -t` process as:
//!
//! ```text
//! C<mode as 4-digit octal> <size> <basename>\n
//! <size raw bytes>
//! \0
//! ```

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Build the `C` control line for a file.
pub fn scp_header(mode: u32, size: u64, name: &str) -> String {
    format!("C{:04o} {} {}\n", mode & 0o777, size, name)
}

/// Write the control line, exactly `size` bytes from `reader`, and the NUL
/// terminator. Returns the number of content bytes written.
pub async fn write_scp_payload<R, W>(
    writer: &mut W,
    reader: &mut R,
    mode: u32,
    size: u64,
    name: &str,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(scp_header(mode, size, name).as_bytes()).await?;

    let copied = tokio::io::copy(&mut reader.take(size), &mut *writer).await?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, read {}", size, copied),
        ));
    }

    writer.write_all(&[0]).await?;
    writer.flush().await?;
    Ok(copied)
}

/// Frame a local file onto `writer`, taking mode and size from its metadata.
/// Returns the basename the remote side will store it under.
pub async fn send_file<W>(writer: &mut W, local_path: &Path) -> io::Result<String>
where
    W: AsyncWrite + Unpin,
{
    use std::os::unix::fs::PermissionsExt;

    let name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no usable file name", local_path.display()),
            )
        })?
        .to_string();

    let mut file = tokio::fs::File::open(local_path).await?;
    let metadata = file.metadata().await?;
    let mode = metadata.permissions().mode();

    write_scp_payload(writer, &mut file, mode, metadata.len(), &name).await?;
    Ok(name)
}
