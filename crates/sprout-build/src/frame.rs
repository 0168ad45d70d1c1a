//! コンテナログの多重化フレーム
//!
//! 各フレームは8バイトのヘッダー（1バイト目がストリーム種別、
//! 末尾4バイトがビッグエンディアンの本文長）と本文からなります。

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0 => StreamKind::Stdin,
            2 => StreamKind::Stderr,
            // 1 と未知の値は stdout として扱う
            _ => StreamKind::Stdout,
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            StreamKind::Stdin => 0,
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl LogFrame {
    /// 本文を行に分割（前後の空白を除き、空行は捨てる）
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.payload)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }
}

/// フレームを1つ読む
///
/// ストリームの終端、または途中で途切れたヘッダー・本文では `None` を返します。
/// 本文長0のフレームは読み飛ばします。
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<LogFrame>> {
    loop {
        let mut header = [0u8; HEADER_LEN];
        if !read_full(reader, &mut header).await? {
            return Ok(None);
        }

        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if size == 0 {
            continue;
        }

        // ヘッダーの長さは信用せず、届いた分だけ確保する
        let mut payload = Vec::new();
        let read = (&mut *reader)
            .take(size as u64)
            .read_to_end(&mut payload)
            .await?;
        if read < size {
            return Ok(None);
        }

        return Ok(Some(LogFrame {
            kind: StreamKind::from_byte(header[0]),
            payload: Bytes::from(payload),
        }));
    }
}

/// バッファを埋めきれたら true、途中で終端に達したら false
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// フレームを組み立てる
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind.as_byte());
    buf.put_slice(&[0, 0, 0]);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}
