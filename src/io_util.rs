/// 批量 I/O 优化模块
///
/// 提供优化的批量写入操作，减少系统调用次数；帧写入器按批刷出时
/// 通过单次矢量写提交整批帧
use std::io::{self, IoSlice};
use tokio::io::AsyncWriteExt;

/// 批量写入辅助函数 - 使用 write_vectored 减少系统调用
pub async fn write_vectored_all<W>(writer: &mut W, bufs: &[&[u8]]) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if bufs.is_empty() {
        return Ok(());
    }

    // 如果只有一个缓冲区，直接使用 write_all
    if bufs.len() == 1 {
        writer.write_all(bufs[0]).await?;
        return writer.flush().await;
    }

    let io_slices: Vec<IoSlice> = bufs.iter().map(|buf| IoSlice::new(buf)).collect();
    let total_bytes: usize = bufs.iter().map(|buf| buf.len()).sum();
    let mut written = 0;

    let mut remaining_slices = &io_slices[..];
    while written < total_bytes {
        match writer.write_vectored(remaining_slices).await {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write vectored data",
                ))
            }
            Ok(n) => {
                written += n;
                if written >= total_bytes {
                    break;
                }
                remaining_slices = advance_slices(remaining_slices, n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    writer.flush().await
}

/// 前进 IoSlice 切片，跳过已写入的字节
///
/// 写入停在切片中间时退回到该切片起点重写；调用方据 written
/// 总量终止，不会多写
fn advance_slices<'a>(slices: &'a [IoSlice<'a>], mut n: usize) -> &'a [IoSlice<'a>] {
    let mut idx = 0;
    for (i, slice) in slices.iter().enumerate() {
        let len = slice.len();
        if n < len {
            return &slices[idx..];
        }
        n -= len;
        idx = i + 1;
        if n == 0 {
            return &slices[idx..];
        }
    }
    &slices[slices.len()..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_vectored_all() {
        let mut buffer = Vec::new();

        let part1 = b"Hello, ";
        let part2 = b"World";
        let part3 = b"!";

        write_vectored_all(&mut buffer, &[part1, part2, part3])
            .await
            .unwrap();

        assert_eq!(&buffer, b"Hello, World!");
    }

    #[tokio::test]
    async fn test_write_vectored_all_single_buf() {
        let mut buffer = Vec::new();
        let data = b"Single buffer";

        write_vectored_all(&mut buffer, &[data]).await.unwrap();

        assert_eq!(&buffer, b"Single buffer");
    }

    #[tokio::test]
    async fn test_write_vectored_all_empty() {
        let mut buffer = Vec::new();

        write_vectored_all(&mut buffer, &[]).await.unwrap();

        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_write_vectored_mixed_empty_slices() {
        let mut buffer = Vec::new();
        write_vectored_all(&mut buffer, &[b"", b"abc", b"", b"de"])
            .await
            .unwrap();
        assert_eq!(&buffer, b"abcde");
    }
}
