use heapless::String;

/// Textual IPv4 address, `xxx.xxx.xxx.xxx`.
pub const IP_MAX_LENGTH: usize = 15;

/// Outcome of a `+CDNSGIP` resolution reply.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DnsReply {
    Resolved(String<IP_MAX_LENGTH>),
    /// `+CDNSGIP: 0` - the modem could not resolve the name.
    Failed,
    /// Reply recognized but not in the shape the modem documents.
    Malformed,
}

pub fn starts_with(line: &[u8], token: &str) -> bool {
    line.len() >= token.len() && &line[..token.len()] == token.as_bytes()
}

/// `+CDNSGIP: 1,"<host>","<ip>"` carries the resolved address in the second
/// quoted field. The modem may append alternate addresses as further quoted
/// fields, so anywhere from 4 to 10 quotes is considered well-formed.
pub fn dns_reply(line: &[u8]) -> Option<DnsReply> {
    if starts_with(line, "+CDNSGIP: 0") {
        return Some(DnsReply::Failed);
    }
    if !starts_with(line, "+CDNSGIP: 1") {
        return None;
    }

    let quotes = line.iter().filter(|&&b| b == b'"').count();
    if !(4..=10).contains(&quotes) {
        return Some(DnsReply::Malformed);
    }

    let mut marks = line
        .iter()
        .enumerate()
        .filter(|(_, &b)| b == b'"')
        .map(|(at, _)| at)
        .skip(2);
    let start = marks.next()? + 1;
    let end = marks.next()?;

    match core::str::from_utf8(&line[start..end]) {
        Ok(ip) => match String::try_from(ip) {
            Ok(ip) => Some(DnsReply::Resolved(ip)),
            Err(_) => Some(DnsReply::Malformed),
        },
        Err(_) => Some(DnsReply::Malformed),
    }
}

/// `+CIPRXGET: 4,0,<n>` - bytes buffered in the modem, not yet pulled.
pub fn rx_available(line: &[u8]) -> Option<u16> {
    if starts_with(line, "+CIPRXGET: 4,0,") {
        decimal(&line[15..])
    } else {
        None
    }
}

/// `+CIPRXGET: 2,0,<n>` - n raw payload bytes follow this line.
pub fn rx_chunk(line: &[u8]) -> Option<u16> {
    if starts_with(line, "+CIPRXGET: 2,0,") {
        decimal(&line[15..])
    } else {
        None
    }
}

/// `+CIPRXGET: 1,0` - unsolicited "data has arrived" notification.
pub fn is_data_notification(line: &[u8]) -> bool {
    starts_with(line, "+CIPRXGET: 1,0")
}

/// `+CSQ: <rssi>,<ber>`
pub fn signal_quality(line: &[u8]) -> Option<u8> {
    if starts_with(line, "+CSQ: ") {
        decimal(&line[6..]).and_then(|rssi| u8::try_from(rssi).ok())
    } else {
        None
    }
}

/// Command echo looks like the command itself, or a stray `\r` when echo
/// suppression raced the first command.
pub fn is_command_echo(line: &[u8]) -> bool {
    starts_with(line, "AT") || line.first() == Some(&b'\r')
}

/// Identity replies (`AT+CGMI` and friends) are free text up to the line end.
pub fn identity(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(line.len());
    &line[..end]
}

pub fn is_ok(line: &[u8]) -> bool {
    trim_line_end(line) == b"OK"
}

pub fn is_error(line: &[u8]) -> bool {
    starts_with(line, "ERROR") || starts_with(line, "+CME ERROR")
}

/// Bounded decimal parse of the leading digit run. No digits or a value
/// beyond `u16::MAX` is a parse failure, never a wrap-around.
fn decimal(bytes: &[u8]) -> Option<u16> {
    let mut value: u16 = 0;
    let mut digits = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value
            .checked_mul(10)?
            .checked_add(u16::from(b - b'0'))?;
        digits += 1;
    }
    if digits == 0 {
        None
    } else {
        Some(value)
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\r' || line[end - 1] == b'\n') {
        end -= 1;
    }
    &line[..end]
}
