//! Netfix line codec.
//!
//! Decoding turns one received line into a [`Frame`] (server side) or a
//! [`Reply`] (client side). Encoding builds complete lines, including the
//! trailing newline, for every reply and request.

use fixgw_core::{DataType, FlagKind, Flags, ItemDefinition, ItemReport, Value};
use thiserror::Error;

use crate::frame::{Command, ErrorCode, Frame, Reply, ValueUpdate};

/// Errors that can occur while decoding a line.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    /// The line was empty after stripping the line terminator.
    #[error("Empty frame")]
    Empty,

    /// The line does not follow the frame grammar.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// A flags field was not five `0`/`1` characters.
    #[error("Bad flags field: {0}")]
    BadFlags(String),
}

fn strip_terminator(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

// ============================================================================
// Flags
// ============================================================================

/// Encode flags as five `0`/`1` characters in `a o b f s` order.
pub fn encode_flags(flags: &Flags) -> String {
    FlagKind::ALL
        .iter()
        .map(|kind| if flags.get(*kind) { '1' } else { '0' })
        .collect()
}

/// Decode a five character flags field.
pub fn decode_flags(field: &str) -> Result<Flags, CodecError> {
    if field.len() != FlagKind::ALL.len() {
        return Err(CodecError::BadFlags(field.to_string()));
    }
    let mut flags = Flags::default();
    for (kind, c) in FlagKind::ALL.iter().zip(field.chars()) {
        match c {
            '0' => {}
            '1' => {
                flags.set(*kind, true);
            }
            _ => return Err(CodecError::BadFlags(field.to_string())),
        }
    }
    Ok(flags)
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a line received by the server.
pub fn decode_frame(line: &str) -> Result<Frame, CodecError> {
    let line = strip_terminator(line);
    if line.is_empty() {
        return Err(CodecError::Empty);
    }

    match line.strip_prefix('@') {
        Some(rest) => decode_command(rest, line).map(Frame::Command),
        None => decode_value_update(line).map(Frame::Value),
    }
}

fn decode_command(rest: &str, line: &str) -> Result<Command, CodecError> {
    let mut chars = rest.chars();
    let letter = chars
        .next()
        .ok_or_else(|| CodecError::Malformed(line.to_string()))?;
    let payload = chars.as_str();

    let command = match letter {
        'l' => Command::List,
        'r' => Command::Read {
            key: payload.to_string(),
        },
        'w' => match payload.split_once(';') {
            Some((key, value)) => Command::Write {
                key: key.to_string(),
                value: Some(value.to_string()),
            },
            None => Command::Write {
                key: payload.to_string(),
                value: None,
            },
        },
        's' => Command::Subscribe {
            key: payload.to_string(),
        },
        'u' => Command::Unsubscribe {
            key: payload.to_string(),
        },
        'q' => Command::Query {
            key: payload.to_string(),
        },
        'f' => {
            let mut parts = payload.splitn(3, ';');
            Command::SetFlag {
                key: parts.next().unwrap_or_default().to_string(),
                flag: parts.next().unwrap_or_default().to_string(),
                setting: parts.next().unwrap_or_default().to_string(),
            }
        }
        'x' => match payload {
            "status" => Command::Status,
            "kill" => Command::Kill,
            other => Command::Extended(other.to_string()),
        },
        other => Command::Unknown {
            letter: other,
            payload: payload.to_string(),
        },
    };
    Ok(command)
}

/// Decode a plain value update line.
///
/// The last field is taken as flags only when it is a valid flags field,
/// so string values containing `;` survive the two-field form.
pub fn decode_value_update(line: &str) -> Result<ValueUpdate, CodecError> {
    let line = strip_terminator(line);
    let (key, rest) = line
        .split_once(';')
        .ok_or_else(|| CodecError::Malformed(line.to_string()))?;
    if key.is_empty() {
        return Err(CodecError::Malformed(line.to_string()));
    }

    let (value, flags) = match rest.rsplit_once(';') {
        Some((value, field)) => match decode_flags(field) {
            Ok(flags) => (value, Some(flags)),
            Err(_) => (rest, None),
        },
        None => (rest, None),
    };

    Ok(ValueUpdate {
        key: key.to_string(),
        value: value.to_string(),
        flags,
    })
}

/// Decode a command reply received by a client.
pub fn decode_reply(line: &str) -> Result<Reply, CodecError> {
    let line = strip_terminator(line);
    let rest = line
        .strip_prefix('@')
        .ok_or_else(|| CodecError::Malformed(line.to_string()))?;
    let mut chars = rest.chars();
    let letter = chars
        .next()
        .ok_or_else(|| CodecError::Malformed(line.to_string()))?;
    let payload = chars.as_str();

    // Error replies end in `!NNN` with a known code.
    if let Some((key, code)) = payload.rsplit_once('!') {
        let code = (code.len() == 3)
            .then(|| code.parse::<u16>().ok())
            .flatten()
            .and_then(ErrorCode::from_code);
        if let Some(code) = code {
            return Ok(Reply {
                letter,
                key: key.to_string(),
                body: Err(code),
            });
        }
    }

    let (key, body) = payload.split_once(';').unwrap_or((payload, ""));
    Ok(Reply {
        letter,
        key: key.to_string(),
        body: Ok(body.to_string()),
    })
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a subscription value update for an item.
///
/// String items use the two-field form without flags.
pub fn encode_value_update(key: &str, data_type: DataType, report: &ItemReport) -> String {
    match data_type {
        DataType::Str => format!("{};{}\n", key, report.value),
        _ => format!("{};{};{}\n", key, report.value, encode_flags(&report.flags)),
    }
}

/// Encode an aux value update, `KEY.AUX;VALUE`.
pub fn encode_aux_update(address: &str, value: Option<&Value>) -> String {
    match value {
        Some(value) => format!("{};{}\n", address, value),
        None => format!("{};\n", address),
    }
}

/// Encode an item reply, `@<letter><key>;<value>;<flags>`.
pub fn encode_item_reply(letter: char, key: &str, report: &ItemReport) -> String {
    format!(
        "@{}{};{};{}\n",
        letter,
        key,
        report.value,
        encode_flags(&report.flags)
    )
}

/// Encode an aux reply, `@<letter><key.aux>;<value>`.
pub fn encode_aux_reply(letter: char, address: &str, value: Option<&Value>) -> String {
    match value {
        Some(value) => format!("@{}{};{}\n", letter, address, value),
        None => format!("@{}{};\n", letter, address),
    }
}

/// Encode an error reply, `@<letter><payload>!NNN`.
pub fn encode_error(letter: char, payload: &str, code: ErrorCode) -> String {
    format!("@{}{}!{}\n", letter, payload, code)
}

/// Encode a bare acknowledgement, `@<letter><payload>`.
pub fn encode_ack(letter: char, payload: &str) -> String {
    format!("@{}{}\n", letter, payload)
}

/// Encode an `@q` description reply.
pub fn encode_describe(def: &ItemDefinition) -> String {
    let bound = |b: Option<f64>| b.map(|v| format!("{v:?}")).unwrap_or_default();
    format!(
        "@q{};{};{};{};{};{};{};{}\n",
        def.key,
        def.description,
        def.data_type,
        bound(def.min),
        bound(def.max),
        def.units,
        def.tol,
        def.aux.join(",")
    )
}

/// Encode an `@xstatus` reply around a JSON document.
pub fn encode_status(json: &str) -> String {
    format!("@xstatus;{}\n", json)
}

fn digits(mut n: usize) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}

/// Encode the `@l` key list, split into messages of at most `buffer_size`
/// bytes (newline included).
///
/// Each message is `@l<total>;<offset>;<comma list>` where `offset` counts
/// the keys sent so far, this message included. A key too long to fit in an
/// empty message is sent on its own.
pub fn encode_list(keys: &[String], buffer_size: usize) -> Vec<String> {
    let total = keys.len();
    if total == 0 {
        return vec!["@l0;0;\n".to_string()];
    }

    let message_len = |offset: usize, list_len: usize| -> usize {
        // "@l" + total + ";" + offset + ";" + list + "\n"
        2 + digits(total) + 1 + digits(offset) + 1 + list_len + 1
    };

    let mut messages = Vec::new();
    let mut batch: Vec<&str> = Vec::new();
    let mut batch_len = 0;
    let mut sent = 0;

    for key in keys {
        let added = if batch.is_empty() { key.len() } else { key.len() + 1 };
        let offset = sent + batch.len() + 1;
        if !batch.is_empty() && message_len(offset, batch_len + added) > buffer_size {
            sent += batch.len();
            messages.push(format!("@l{};{};{}\n", total, sent, batch.join(",")));
            batch.clear();
            batch_len = 0;
        }
        batch_len += if batch.is_empty() { key.len() } else { key.len() + 1 };
        batch.push(key);
    }

    sent += batch.len();
    messages.push(format!("@l{};{};{}\n", total, sent, batch.join(",")));
    messages
}

/// Encode a request line for a command.
pub fn encode_command(command: &Command) -> String {
    match command {
        Command::List => "@l\n".to_string(),
        Command::Read { key } => format!("@r{}\n", key),
        Command::Write {
            key,
            value: Some(value),
        } => format!("@w{};{}\n", key, value),
        Command::Write { key, value: None } => format!("@w{}\n", key),
        Command::Subscribe { key } => format!("@s{}\n", key),
        Command::Unsubscribe { key } => format!("@u{}\n", key),
        Command::Query { key } => format!("@q{}\n", key),
        Command::SetFlag { key, flag, setting } => format!("@f{};{};{}\n", key, flag, setting),
        Command::Status => "@xstatus\n".to_string(),
        Command::Kill => "@xkill\n".to_string(),
        Command::Extended(payload) => format!("@x{}\n", payload),
        Command::Unknown { letter, payload } => format!("@{}{}\n", letter, payload),
    }
}

/// Encode a plain value update sent by a client.
pub fn encode_value_write(update: &ValueUpdate) -> String {
    match &update.flags {
        Some(flags) => format!("{};{};{}\n", update.key, update.value, encode_flags(flags)),
        None => format!("{};{}\n", update.key, update.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(value: Value, flags: Flags) -> ItemReport {
        ItemReport { value, flags }
    }

    #[test]
    fn test_flags_encoding() {
        let flags = Flags {
            annunciate: true,
            fail: true,
            ..Flags::default()
        };
        assert_eq!(encode_flags(&flags), "10010");
        assert_eq!(decode_flags("10010").unwrap(), flags);
        assert_eq!(encode_flags(&Flags::default()), "00000");
        assert!(decode_flags("1001").is_err());
        assert!(decode_flags("10x10").is_err());
    }

    #[test]
    fn test_decode_value_update() {
        let frame = decode_frame("ALT;2500;00100\n").unwrap();
        match frame {
            Frame::Value(update) => {
                assert_eq!(update.key, "ALT");
                assert_eq!(update.value, "2500");
                assert!(update.flags.unwrap().bad);
            }
            _ => panic!("Expected value update"),
        }

        let update = decode_value_update("TAILNUM;N12345\n").unwrap();
        assert_eq!(update.value, "N12345");
        assert_eq!(update.flags, None);

        let update = decode_value_update("MSG;a;b").unwrap();
        assert_eq!(update.value, "a;b");
        assert_eq!(update.flags, None);
    }

    #[test]
    fn test_decode_malformed() {
        assert_eq!(decode_frame("\n"), Err(CodecError::Empty));
        assert!(matches!(decode_frame("garbage"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode_frame(";5"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode_frame("@"), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_decode_commands() {
        assert_eq!(decode_frame("@l\n").unwrap(), Frame::Command(Command::List));
        assert_eq!(
            decode_frame("@rALT\r\n").unwrap(),
            Frame::Command(Command::Read { key: "ALT".into() })
        );
        assert_eq!(
            decode_frame("@wALT;2500").unwrap(),
            Frame::Command(Command::Write {
                key: "ALT".into(),
                value: Some("2500".into())
            })
        );
        assert_eq!(
            decode_frame("@wALT").unwrap(),
            Frame::Command(Command::Write {
                key: "ALT".into(),
                value: None
            })
        );
        assert_eq!(
            decode_frame("@fALT;b;1").unwrap(),
            Frame::Command(Command::SetFlag {
                key: "ALT".into(),
                flag: "b".into(),
                setting: "1".into()
            })
        );
        assert_eq!(
            decode_frame("@xstatus").unwrap(),
            Frame::Command(Command::Status)
        );
        assert_eq!(
            decode_frame("@xreboot").unwrap(),
            Frame::Command(Command::Extended("reboot".into()))
        );
        assert_eq!(
            decode_frame("@zALT").unwrap(),
            Frame::Command(Command::Unknown {
                letter: 'z',
                payload: "ALT".into()
            })
        );
    }

    #[test]
    fn test_encode_replies() {
        let r = report(Value::Float(2500.0), Flags::default());
        assert_eq!(encode_item_reply('w', "ALT", &r), "@wALT;2500.0;00000\n");
        assert_eq!(
            encode_value_update("ALT", DataType::Float, &r),
            "ALT;2500.0;00000\n"
        );
        assert_eq!(
            encode_value_update(
                "TAILNUM",
                DataType::Str,
                &report(Value::from("N12345"), Flags::default())
            ),
            "TAILNUM;N12345\n"
        );
        assert_eq!(
            encode_error('r', "JUNKID", ErrorCode::KeyNotFound),
            "@rJUNKID!001\n"
        );
        assert_eq!(encode_ack('s', "ALT"), "@sALT\n");
        assert_eq!(
            encode_aux_reply('r', "IAS.Vs", Some(&Value::Float(45.0))),
            "@rIAS.Vs;45.0\n"
        );
        assert_eq!(encode_aux_reply('r', "IAS.Vs", None), "@rIAS.Vs;\n");
    }

    #[test]
    fn test_encode_describe() {
        let def = ItemDefinition::new("IAS", DataType::Float)
            .with_description("Indicated Airspeed")
            .with_range(0.0, 1000.0)
            .with_units("knots")
            .with_tol(2000)
            .with_aux(["Min", "Max"]);
        assert_eq!(
            encode_describe(&def),
            "@qIAS;Indicated Airspeed;float;0.0;1000.0;knots;2000;Min,Max\n"
        );

        let def = ItemDefinition::new("TAILNUM", DataType::Str);
        assert_eq!(encode_describe(&def), "@qTAILNUM;;str;;;;0;\n");
    }

    #[test]
    fn test_encode_list_single_page() {
        let keys: Vec<String> = ["ALT", "IAS", "OAT"].iter().map(|s| s.to_string()).collect();
        assert_eq!(encode_list(&keys, 1024), vec!["@l3;3;ALT,IAS,OAT\n"]);
        assert_eq!(encode_list(&[], 1024), vec!["@l0;0;\n"]);
    }

    #[test]
    fn test_encode_list_paginates() {
        let keys: Vec<String> = (0..40).map(|i| format!("KEY{:02}", i)).collect();
        let messages = encode_list(&keys, 64);

        assert!(messages.len() > 1);
        let mut collected = Vec::new();
        let mut last_offset = 0;
        for msg in &messages {
            assert!(msg.len() <= 64, "{msg:?} exceeds buffer");
            let body = msg.trim_end().strip_prefix("@l").unwrap();
            let mut parts = body.splitn(3, ';');
            assert_eq!(parts.next().unwrap(), "40");
            let offset: usize = parts.next().unwrap().parse().unwrap();
            let list: Vec<&str> = parts.next().unwrap().split(',').collect();
            assert_eq!(offset, last_offset + list.len());
            last_offset = offset;
            collected.extend(list.into_iter().map(String::from));
        }
        assert_eq!(last_offset, 40);
        assert_eq!(collected, keys);
    }

    #[test]
    fn test_decode_reply() {
        let reply = decode_reply("@wALT;2500.0;00000\n").unwrap();
        assert_eq!(reply.letter, 'w');
        assert_eq!(reply.key, "ALT");
        assert_eq!(reply.fields(), vec!["2500.0", "00000"]);

        let reply = decode_reply("@rJUNKID!001\n").unwrap();
        assert_eq!(reply.key, "JUNKID");
        assert_eq!(reply.body, Err(ErrorCode::KeyNotFound));

        let reply = decode_reply("@sALT").unwrap();
        assert_eq!(reply.body, Ok(String::new()));
        assert!(reply.fields().is_empty());

        let reply = decode_reply("@xstatus;{\"a\":1}").unwrap();
        assert_eq!(reply.key, "status");
        assert_eq!(reply.body, Ok("{\"a\":1}".to_string()));

        assert!(decode_reply("ALT;1.0;00000").is_err());
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(
            encode_command(&Command::Write {
                key: "ALT".into(),
                value: Some("2500".into())
            }),
            "@wALT;2500\n"
        );
        assert_eq!(encode_command(&Command::Status), "@xstatus\n");
        assert_eq!(
            encode_value_write(&ValueUpdate {
                key: "ALT".into(),
                value: "10".into(),
                flags: Some(Flags::default())
            }),
            "ALT;10;00000\n"
        );
    }
}
