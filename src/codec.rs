use bytes::Bytes;

use crate::{
  error::{Error, Result},
  value::Flags,
};

pub const END: &[u8] = b"END";
pub const STORED: &[u8] = b"STORED";
pub const DELETED: &[u8] = b"DELETED";
pub const NOT_FOUND: &[u8] = b"NOT_FOUND";

pub const MAX_KEY_LEN: usize = 250;

/// Largest data block accepted from a server, memcached's own item size
/// ceiling.
pub const MAX_VALUE_LEN: usize = 1 << 30;

#[derive(Debug, PartialEq)]
pub struct KeyCommandRef<'a> {
  pub key: &'a [u8],
}

#[derive(Debug, PartialEq)]
pub struct SetCommandRef<'a> {
  pub key: &'a [u8],
  pub value: &'a [u8],
  pub flags: Flags,
  pub exptime: u32,
  pub cas: Option<u64>,
}

#[derive(Debug, PartialEq)]
pub struct IncrDecrCommandRef<'a> {
  pub key: &'a [u8],
  pub delta: u64,
}

#[derive(Debug, PartialEq)]
pub enum CommandRef<'a> {
  Get(KeyCommandRef<'a>),
  Gets(KeyCommandRef<'a>),
  GetM { keys: Vec<&'a [u8]> },
  Set(SetCommandRef<'a>),
  Add(SetCommandRef<'a>),
  Replace(SetCommandRef<'a>),
  Cas(SetCommandRef<'a>),
  Delete(KeyCommandRef<'a>),
  Incr(IncrDecrCommandRef<'a>),
  Decr(IncrDecrCommandRef<'a>),
}

impl CommandRef<'_> {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Get(_) | Self::GetM { .. } => "get",
      Self::Gets(_) => "gets",
      Self::Set(_) => "set",
      Self::Add(_) => "add",
      Self::Replace(_) => "replace",
      Self::Cas(_) => "cas",
      Self::Delete(_) => "delete",
      Self::Incr(_) => "incr",
      Self::Decr(_) => "decr",
    }
  }
}

/// Frames a command for the text protocol, payload included. Keys are
/// written as raw bytes.
pub fn encode_text_command(command: &CommandRef) -> Vec<u8> {
  fn encode_line(op: &str, keys: &[&[u8]], args: &str) -> Vec<u8> {
    let len = keys.iter().map(|k| k.len() + 1).sum::<usize>();
    let mut buffer = Vec::with_capacity(op.len() + len + args.len() + 2);
    buffer.extend_from_slice(op.as_bytes());
    for key in keys {
      buffer.push(b' ');
      buffer.extend_from_slice(key);
    }
    buffer.extend_from_slice(args.as_bytes());
    buffer.extend_from_slice(b"\r\n");
    buffer
  }

  fn encode_set_command(op: &str, cmd: &SetCommandRef) -> Vec<u8> {
    let args = match cmd.cas {
      Some(cas) => format!(" {} {} {} {}", cmd.flags, cmd.exptime, cmd.value.len(), cas),
      None => format!(" {} {} {}", cmd.flags, cmd.exptime, cmd.value.len()),
    };
    let mut buffer = encode_line(op, &[cmd.key], &args);
    buffer.extend_from_slice(cmd.value);
    buffer.extend_from_slice(b"\r\n");
    buffer
  }

  match command {
    CommandRef::Get(KeyCommandRef { key }) => encode_line("get", &[*key], ""),
    CommandRef::Gets(KeyCommandRef { key }) => encode_line("gets", &[*key], ""),
    CommandRef::GetM { keys } => encode_line("get", keys, ""),
    CommandRef::Set(cmd) => encode_set_command("set", cmd),
    CommandRef::Add(cmd) => encode_set_command("add", cmd),
    CommandRef::Replace(cmd) => encode_set_command("replace", cmd),
    CommandRef::Cas(cmd) => encode_set_command("cas", cmd),
    CommandRef::Delete(KeyCommandRef { key }) => encode_line("delete", &[*key], ""),
    CommandRef::Incr(IncrDecrCommandRef { key, delta }) => encode_line("incr", &[*key], &format!(" {delta}")),
    CommandRef::Decr(IncrDecrCommandRef { key, delta }) => encode_line("decr", &[*key], &format!(" {delta}")),
  }
}

/// Checks a key (with its prefix) against the protocol's key rules and
/// returns the prefixed key.
pub fn check_key(key: &[u8], prefix: &[u8]) -> Result<Vec<u8>> {
  let mut full = Vec::with_capacity(prefix.len() + key.len());
  full.extend_from_slice(prefix);
  full.extend_from_slice(key);

  if full.is_empty() {
    return Err(Error::Key("key is empty".to_string()));
  }
  if !full.iter().all(|&b| matches!(b, 0x21..=0x7e | 0x80..=0xff)) {
    return Err(Error::Key(format!(
      "key contains invalid character: {:?}",
      String::from_utf8_lossy(&full)
    )));
  }
  if full.len() > MAX_KEY_LEN {
    return Err(Error::Key(format!("key is too long: {}", String::from_utf8_lossy(&full))));
  }
  Ok(full)
}

/// Maps the error replies shared by every command onto typed errors.
pub fn check_reply(line: &[u8], command: &str) -> Result<()> {
  fn message(line: &[u8]) -> String {
    let message = line
      .iter()
      .position(|b| *b == b' ')
      .map(|pos| &line[pos + 1..])
      .unwrap_or(line);
    String::from_utf8_lossy(message).into_owned()
  }

  if line.starts_with(b"ERROR") {
    return Err(Error::UnknownCommand(command.to_string()));
  }
  if line.starts_with(b"CLIENT_ERROR") {
    return Err(Error::Client(message(line)));
  }
  if line.starts_with(b"SERVER_ERROR") {
    return Err(Error::Server(message(line)));
  }
  Ok(())
}

/// `VALUE <key> <flags> <bytes>[ <cas>]`
#[derive(Debug, PartialEq)]
pub struct ValueHeader {
  pub key: Vec<u8>,
  pub flags: Flags,
  pub len: usize,
  pub cas: Option<u64>,
}

/// Parses a value line. Lengths above [`MAX_VALUE_LEN`] are rejected before
/// anything is allocated for the data block.
pub fn decode_value_header(line: &[u8]) -> Result<ValueHeader> {
  fn number<T: std::str::FromStr>(chunk: Option<&[u8]>) -> Option<T> {
    std::str::from_utf8(chunk?).ok()?.parse().ok()
  }

  let invalid = || Error::Protocol(format!("invalid value line: {:?}", String::from_utf8_lossy(line)));
  let mut chunks = line.split(|b| *b == b' ');

  if chunks.next() != Some(b"VALUE".as_slice()) {
    return Err(invalid());
  }

  let key = chunks.next().filter(|k| !k.is_empty()).ok_or_else(invalid)?;
  let flags = number(chunks.next()).map(Flags::from_bits).ok_or_else(invalid)?;
  let len: usize = number(chunks.next()).ok_or_else(invalid)?;
  let cas = match chunks.next() {
    Some(cas) => Some(number(Some(cas)).ok_or_else(invalid)?),
    None => None,
  };

  if chunks.next().is_some() {
    return Err(invalid());
  }
  if len > MAX_VALUE_LEN {
    return Err(Error::Protocol(format!("value of {len} bytes exceeds {MAX_VALUE_LEN}")));
  }

  Ok(ValueHeader {
    key: key.to_vec(),
    flags,
    len,
    cas,
  })
}

/// Strips the CRLF that follows a data block.
pub fn strip_data_terminator(mut block: Bytes) -> Result<Bytes> {
  if !block.ends_with(b"\r\n") {
    return Err(Error::Protocol("data block not terminated by CRLF".to_string()));
  }
  block.truncate(block.len() - 2);
  Ok(block)
}

/// Parses an incr/decr reply; anything but plain digits is a miss.
pub fn decode_numeric(line: &[u8]) -> Option<u64> {
  if line.is_empty() || !line.iter().all(u8::is_ascii_digit) {
    return None;
  }
  std::str::from_utf8(line).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
  use bytes::Bytes;

  use super::{
    check_key, check_reply, decode_numeric, decode_value_header, encode_text_command, strip_data_terminator,
    CommandRef, IncrDecrCommandRef, KeyCommandRef, SetCommandRef, ValueHeader,
  };
  use crate::{error::Error, value::Flags};

  #[test]
  fn test_encode_text_command() {
    let tests: &[(CommandRef, &[u8])] = &[
      (CommandRef::Get(KeyCommandRef { key: b"foo" }), b"get foo\r\n"),
      (CommandRef::Gets(KeyCommandRef { key: b"foo" }), b"gets foo\r\n"),
      (
        CommandRef::GetM {
          keys: vec![&b"foo"[..], &b"bar"[..], &b"baz"[..]],
        },
        b"get foo bar baz\r\n",
      ),
      (
        CommandRef::Set(SetCommandRef {
          key: b"foo",
          value: b"bar",
          flags: Flags::INTEGER,
          exptime: 321,
          cas: None,
        }),
        b"set foo 2 321 3\r\nbar\r\n",
      ),
      (
        CommandRef::Add(SetCommandRef {
          key: b"foo",
          value: b"",
          flags: Flags::empty(),
          exptime: 0,
          cas: None,
        }),
        b"add foo 0 0 0\r\n\r\n",
      ),
      (
        CommandRef::Replace(SetCommandRef {
          key: b"foo",
          value: b"bar",
          flags: Flags::empty(),
          exptime: 5,
          cas: None,
        }),
        b"replace foo 0 5 3\r\nbar\r\n",
      ),
      (
        CommandRef::Cas(SetCommandRef {
          key: b"foo",
          value: b"bar",
          flags: Flags::SERIALIZED | Flags::COMPRESSED,
          exptime: 5,
          cas: Some(567),
        }),
        b"cas foo 9 5 3 567\r\nbar\r\n",
      ),
      (CommandRef::Delete(KeyCommandRef { key: b"foo" }), b"delete foo\r\n"),
      (
        CommandRef::Incr(IncrDecrCommandRef { key: b"foo", delta: 3 }),
        b"incr foo 3\r\n",
      ),
      (
        CommandRef::Decr(IncrDecrCommandRef { key: b"foo", delta: 1 }),
        b"decr foo 1\r\n",
      ),
    ];

    for (command, expected) in tests {
      assert_eq!(*expected, encode_text_command(command).as_slice(), "{command:?}");
    }
  }

  #[test]
  fn test_check_key() {
    assert_eq!(b"foo", check_key(b"foo", b"").unwrap().as_slice());
    assert_eq!(b"p_foo", check_key(b"foo", b"p_").unwrap().as_slice());
    assert_eq!("clé".as_bytes(), check_key("clé".as_bytes(), b"").unwrap().as_slice());
    assert_eq!(b"\xff\xfe", check_key(b"\xff\xfe", b"").unwrap().as_slice());
    assert_eq!(250, check_key("k".repeat(248).as_bytes(), b"p_").unwrap().len());

    let keys: &[&[u8]] = &[b"", b"foo bar", b"foo\r\n", b"tab\there", b"\x7f", b"nul\x00"];
    for key in keys {
      assert!(matches!(check_key(key, b""), Err(Error::Key(_))), "{key:?}");
    }
    assert!(matches!(check_key("k".repeat(251).as_bytes(), b""), Err(Error::Key(_))));
    assert!(matches!(check_key("k".repeat(249).as_bytes(), b"p_"), Err(Error::Key(_))));
    assert!(matches!(check_key(b"foo", b"bad prefix"), Err(Error::Key(_))));
  }

  #[test]
  fn test_check_reply() {
    assert!(check_reply(b"STORED", "set").is_ok());
    assert!(check_reply(b"END", "get").is_ok());
    assert!(matches!(check_reply(b"ERROR", "get"), Err(Error::UnknownCommand(cmd)) if cmd == "get"));
    assert!(matches!(
      check_reply(b"CLIENT_ERROR bad data chunk", "set"),
      Err(Error::Client(msg)) if msg == "bad data chunk"
    ));
    assert!(matches!(
      check_reply(b"SERVER_ERROR out of memory storing object", "set"),
      Err(Error::Server(msg)) if msg == "out of memory storing object"
    ));
  }

  #[test]
  fn test_decode_value_header() {
    assert_eq!(
      ValueHeader {
        key: b"foo".to_vec(),
        flags: Flags::INTEGER,
        len: 3,
        cas: None,
      },
      decode_value_header(b"VALUE foo 2 3").unwrap()
    );
    assert_eq!(
      ValueHeader {
        key: b"foo".to_vec(),
        flags: Flags::empty(),
        len: 0,
        cas: Some(42),
      },
      decode_value_header(b"VALUE foo 0 0 42").unwrap()
    );
    assert_eq!(b"\xff\xfe", decode_value_header(b"VALUE \xff\xfe 0 1").unwrap().key.as_slice());

    let lines: &[&[u8]] = &[
      b"VALUE foo 2",
      b"VALUE foo x 3",
      b"VALUE foo 0 -1",
      b"VALUE foo 0 3 x",
      b"VALUE foo 0 3 1 2",
      b"VALUES foo 0 3",
      b"VALUE foo 0 18446744073709551615",
      b"VALUE foo 0 99999999999999999999999",
      b"VALUE foo 0 1073741825",
      b"END",
    ];
    for line in lines {
      assert!(
        matches!(decode_value_header(line), Err(Error::Protocol(_))),
        "{:?}",
        String::from_utf8_lossy(line)
      );
    }
  }

  #[test]
  fn test_strip_data_terminator() {
    assert_eq!(&b"bar"[..], strip_data_terminator(Bytes::from_static(b"bar\r\n")).unwrap());
    assert_eq!(&b""[..], strip_data_terminator(Bytes::from_static(b"\r\n")).unwrap());
    assert!(strip_data_terminator(Bytes::from_static(b"barEN")).is_err());
  }

  #[test]
  fn test_decode_numeric() {
    assert_eq!(Some(10), decode_numeric(b"10"));
    assert_eq!(Some(0), decode_numeric(b"0"));
    assert_eq!(None, decode_numeric(b"NOT_FOUND"));
    assert_eq!(None, decode_numeric(b""));
    assert_eq!(None, decode_numeric(b"-1"));
  }
}
