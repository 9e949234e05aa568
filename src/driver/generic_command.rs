//! Generic command-channel drivers: ComPort / TCPIP / Console / SSH /
//! SSH+ComPort (spec §4.B). Execute a user-supplied command string (`\n` /
//! `\r` escapes honored), return the raw response; optional keyword
//! extraction (`keyword`, `split_count`, `split_length`) slices a substring
//! out of the response.
//!
//! Grounded on
//! `examples/original_source/backend/app/services/measurement_service.py`'s
//! `_process_keyword_extraction` (1-based `split_count` converted to a
//! 0-based start offset, `split_length` characters taken from there).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::Transport;

/// Expand `\n`/`\r` escape sequences in a user-authored command string.
fn unescape_command(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('n') => {
                    out.push('\n');
                    chars.next();
                }
                Some('r') => {
                    out.push('\r');
                    chars.next();
                }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Extract a substring following `keyword`, mirroring the original
/// 1-based `split_count` → 0-based offset conversion.
fn extract_keyword(response: &str, keyword: &str, split_count: i64, split_length: i64) -> EngineResult<String> {
    let idx = response.find(keyword).ok_or_else(|| {
        EngineError::DomainError(format!("could not extract value using keyword '{keyword}'"))
    })?;
    let after = &response[idx + keyword.len()..];

    let start = (split_count - 1).max(0) as usize;
    let end = start + split_length.max(0) as usize;
    if split_count < 1 || end > after.len() {
        return Err(EngineError::DomainError(format!(
            "could not extract value using keyword '{keyword}'"
        )));
    }
    Ok(after[start..end].to_string())
}

/// Which underlying transport backs this generic command channel. The
/// driver logic (escape handling, keyword extraction) is identical across
/// all five families named in spec §4.B; only the transport differs.
pub struct GenericCommandDriver {
    transport: Box<dyn Transport>,
    command_timeout: Duration,
}

impl GenericCommandDriver {
    pub fn new(transport: Box<dyn Transport>, command_timeout: Duration) -> Self {
        Self {
            transport,
            command_timeout,
        }
    }
}

#[async_trait]
impl Driver for GenericCommandDriver {
    async fn initialize(&mut self) -> EngineResult<()> {
        self.transport.open().await
    }

    async fn reset(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn retry_safe(&self) -> bool {
        true
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        match command {
            // `"comport"`/`"console"`/`"tcpip"` are the special `switch_mode`
            // values `resolved_command()` (model/plan.rs) passes through
            // verbatim as `command` (spec §4.D step 1, §9 Open Question);
            // they share the exact same parameter shape as `"SendCommand"`.
            "SendCommand" | "comport" | "console" | "tcpip" => Some(ParamSchema::new(
                ["command_text"],
                ["keyword", "split_count", "split_length"],
                "command_text=STATUS?\\n,keyword=VOLT=,split_count=1,split_length=5",
            )),
            _ => None,
        }
    }

    async fn execute_command(
        &mut self,
        command: &str,
        params: &HashMap<String, ParameterValue>,
    ) -> EngineResult<String> {
        match command {
            "SendCommand" | "comport" | "console" | "tcpip" => {
                let command_text = require(params, command, "command_text")?
                    .as_str()
                    .ok_or_else(|| {
                        EngineError::BadParameter("command_text must be a string".into())
                    })?;
                let expanded = unescape_command(command_text);

                self.transport.send(expanded.as_bytes()).await?;
                let raw = self.transport.recv(self.command_timeout).await?;
                let response = String::from_utf8_lossy(&raw).trim().to_string();

                match params.get("keyword").and_then(ParameterValue::as_str) {
                    Some(keyword) => {
                        let split_count = params
                            .get("split_count")
                            .and_then(ParameterValue::as_i64)
                            .unwrap_or(1);
                        let split_length = params
                            .get("split_length")
                            .and_then(ParameterValue::as_i64)
                            .unwrap_or(response.len() as i64);
                        extract_keyword(&response, keyword, split_count, split_length)
                    }
                    None => Ok(response),
                }
            }
            other => Err(EngineError::BadParameter(format!(
                "generic command driver does not support command '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_expands_newline_and_carriage_return() {
        assert_eq!(unescape_command("STATUS?\\n"), "STATUS?\n");
        assert_eq!(unescape_command("A\\rB"), "A\rB");
    }

    #[test]
    fn extract_keyword_takes_the_declared_slice() {
        let response = "STATUS OK VOLT=05.021 END";
        assert_eq!(
            extract_keyword(response, "VOLT=", 1, 6).unwrap(),
            "05.021"
        );
    }

    #[test]
    fn extract_keyword_fails_when_keyword_absent() {
        let err = extract_keyword("STATUS OK", "VOLT=", 1, 5).unwrap_err();
        assert!(matches!(err, EngineError::DomainError(_)));
    }

    #[tokio::test]
    async fn special_switch_mode_names_are_accepted_like_send_command() {
        use crate::transport::simulated::SimulatedTransport;
        for mode in ["comport", "console", "tcpip"] {
            let mut d = GenericCommandDriver::new(
                Box::new(SimulatedTransport::new("console")),
                Duration::from_secs(1),
            );
            d.initialize().await.unwrap();
            assert!(d.schema_for(mode, None).is_some());

            let mut params = HashMap::new();
            params.insert(
                "command_text".to_string(),
                ParameterValue::Str("STATUS?".into()),
            );
            let result = d.execute_command(mode, &params).await.unwrap();
            assert!(!result.is_empty());
        }
    }

    #[tokio::test]
    async fn send_command_without_keyword_returns_raw_response() {
        use crate::transport::simulated::SimulatedTransport;
        let mut d = GenericCommandDriver::new(
            Box::new(SimulatedTransport::new("console")),
            Duration::from_secs(1),
        );
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert(
            "command_text".to_string(),
            ParameterValue::Str("STATUS?".into()),
        );
        let result = d.execute_command("SendCommand", &params).await.unwrap();
        assert!(!result.is_empty());
    }
}
