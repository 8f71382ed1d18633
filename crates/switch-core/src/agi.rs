//! AGI-style per-call control channel: the switch opens one connection per
//! answered channel, sends its call environment as `key: value` lines
//! terminated by a blank line, then accepts newline-delimited commands
//! (`STREAM FILE`, `WAIT FOR DIGIT`, `EXEC Dial`, `SET VARIABLE`,
//! `HANGUP`), each answered with a numeric result code.

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use crate::error::{Result, SwitchError};

/// The call environment handed over before any command is accepted:
/// channel name, unique id, and whatever channel variables (correlation
/// id, project id) the dialplan injected ahead of the AGI app.
#[derive(Debug, Clone, Default)]
pub struct AgiRequest {
    env: HashMap<String, String>,
}

impl AgiRequest {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

/// One command's result: the numeric status line and its `result=` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgiResult {
    pub code: u32,
    pub value: String,
}

/// A per-call control channel, positioned to accept commands once its
/// environment has been consumed by [`accept_agi_session`].
pub struct AgiConnection<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: WriteHalf<T>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgiConnection<T> {
    async fn command(&mut self, line: &str) -> Result<AgiResult> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        let mut response = String::new();
        self.reader.read_line(&mut response).await?;
        parse_agi_result(&response)
    }

    /// Plays `file` on the channel, interruptible by any digit in
    /// `escape_digits`. `result` carries the interrupting digit's ASCII
    /// code, or `0` if none was pressed before playback finished.
    pub async fn stream_file(&mut self, file: &str, escape_digits: &str) -> Result<AgiResult> {
        self.command(&format!("STREAM FILE {file} \"{escape_digits}\"")).await
    }

    /// Blocks up to `timeout_ms` for a single DTMF digit.
    pub async fn wait_for_digit(&mut self, timeout_ms: u64) -> Result<Option<char>> {
        let result = self.command(&format!("WAIT FOR DIGIT {timeout_ms}")).await?;
        let code: i64 = result.value.parse().unwrap_or(0);
        if code <= 0 {
            Ok(None)
        } else {
            Ok(char::from_u32(code as u32))
        }
    }

    pub async fn exec_dial(&mut self, destination: &str) -> Result<AgiResult> {
        self.command(&format!("EXEC Dial \"{destination}\"")).await
    }

    pub async fn set_variable(&mut self, name: &str, value: &str) -> Result<AgiResult> {
        self.command(&format!("SET VARIABLE {name} \"{value}\"")).await
    }

    pub async fn hangup(&mut self) -> Result<AgiResult> {
        self.command("HANGUP").await
    }
}

/// Reads the environment block off a freshly accepted connection and
/// returns it alongside a connection ready to accept commands.
pub async fn accept_agi_session<T: AsyncRead + AsyncWrite + Unpin + Send>(
    io: T,
) -> Result<(AgiRequest, AgiConnection<T>)> {
    let (read_half, write_half) = tokio::io::split(io);
    let mut reader = BufReader::new(read_half);
    let mut env = HashMap::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        if let Some((k, v)) = line.trim_end().split_once(':') {
            env.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    Ok((AgiRequest { env }, AgiConnection { reader, writer: write_half }))
}

fn parse_agi_result(line: &str) -> Result<AgiResult> {
    let line = line.trim();
    if line.is_empty() {
        return Err(SwitchError::Protocol("empty control channel response".to_string()));
    }
    let (code_str, rest) = line.split_once(' ').unwrap_or((line, ""));
    let code: u32 = code_str
        .parse()
        .map_err(|_| SwitchError::Protocol(format!("bad control channel response: {line}")))?;
    let value = rest
        .split_once("result=")
        .map(|(_, v)| v.split_whitespace().next().unwrap_or("").to_string())
        .unwrap_or_default();
    Ok(AgiResult { code, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn reads_environment_then_accepts_commands() {
        let (mut switch_side, handler_side) = duplex(4096);
        tokio::spawn(async move {
            switch_side
                .write_all(b"agi_channel: SIP/sbc233-001\nagi_corr_id: c-1\n\n")
                .await
                .unwrap();
            let mut buf = [0u8; 256];
            let _ = switch_side.read(&mut buf).await;
            switch_side.write_all(b"200 result=0\n").await.unwrap();
        });

        let (req, mut conn) = accept_agi_session(handler_side).await.unwrap();
        assert_eq!(req.get("agi_corr_id"), Some("c-1"));
        let result = conn.stream_file("welcome", "0123456789").await.unwrap();
        assert_eq!(result.code, 200);
        assert_eq!(result.value, "0");
    }

    #[test]
    fn parses_digit_result_from_wait_for_digit() {
        let result = parse_agi_result("200 result=49\n").unwrap();
        assert_eq!(result.value, "49");
        assert_eq!(char::from_u32(49).unwrap(), '1');
    }
}
