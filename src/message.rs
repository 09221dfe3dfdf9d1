use std::fmt;

/// Lines carry raw message bytes one per char, so only ASCII whitespace
/// counts: U+0085 and U+00A0 are ordinary 8-bit bytes here.
fn trim_ascii(s: &str) -> &str {
    s.trim_matches(|c: char| c.is_ascii_whitespace())
}

/// One header field, kept as the raw lines it arrived in so an untouched
/// message can be written back exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    name: String,
    lines: Vec<String>,
}

impl Header {
    fn new(name: &str, value: &str) -> Self {
        let normalized = value.replace("\r\n", "\n").replace('\r', "\n");
        let mut parts = normalized.split('\n');
        let first = parts.next().unwrap_or_default();

        let mut lines = vec![format!("{name}: {first}")];
        for part in parts {
            if trim_ascii(part).is_empty() {
                continue;
            }
            if part.starts_with([' ', '\t']) {
                lines.push(part.to_string());
            } else {
                lines.push(format!("\t{part}"));
            }
        }

        Header {
            name: name.to_string(),
            lines,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unfolded value with surrounding whitespace removed.
    pub fn value(&self) -> String {
        let first = self.lines[0]
            .split_once(':')
            .map(|(_, v)| v)
            .unwrap_or_default();
        let mut value = trim_ascii(first).to_string();
        for cont in &self.lines[1..] {
            let cont = trim_ascii(cont);
            if cont.is_empty() {
                continue;
            }
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(cont);
        }
        value
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// A message split into its header section and body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    headers: Vec<Header>,
    separator: bool,
    body: Vec<String>,
}

/// Field name of a header line, if the line is one.
fn header_name(line: &str) -> Option<&str> {
    let (name, _) = line.split_once(':')?;
    let valid = !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b));
    valid.then_some(name)
}

impl Message {
    /// Parse a message from its lines, without line terminators.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut message = Message::default();
        let mut pos = 0;

        while pos < lines.len() {
            let line = lines[pos].as_ref();
            if line.is_empty() {
                message.separator = true;
                pos += 1;
                break;
            }
            if line.starts_with([' ', '\t']) {
                match message.headers.last_mut() {
                    Some(header) => header.lines.push(line.to_string()),
                    None => break,
                }
            } else {
                match header_name(line) {
                    Some(name) => message.headers.push(Header {
                        name: name.to_string(),
                        lines: vec![line.to_string()],
                    }),
                    None => break,
                }
            }
            pos += 1;
        }

        message.body = lines[pos..]
            .iter()
            .map(|l| l.as_ref().to_string())
            .collect();
        message
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First value of the named header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(Header::value)
    }

    /// Set a header, replacing the first field of that name in place and
    /// dropping any later duplicates. Appends when the header is absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let header = Header::new(name, value);
        match self
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(name))
        {
            Some(pos) => {
                self.headers[pos] = header;
                let mut index = 0;
                self.headers.retain(|h| {
                    let keep = index <= pos || !h.name.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.headers.push(header),
        }
        if !self.body.is_empty() {
            self.separator = true;
        }
    }

    /// Append a header without touching existing fields of the same name.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push(Header::new(name, value));
        if !self.body.is_empty() {
            self.separator = true;
        }
    }

    pub fn body(&self) -> String {
        self.body.join("\n")
    }

    /// Wire lines: headers, the separator if any, then the body.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.headers
            .iter()
            .flat_map(|h| h.lines.iter().map(String::as_str))
            .chain(self.separator.then_some(""))
            .chain(self.body.iter().map(String::as_str))
    }

    /// The message as handed to the scanner: dot-stuffing removed and
    /// every line terminated.
    pub fn to_scan_text(&self) -> String {
        let mut text = String::new();
        for line in self.lines() {
            text.push_str(line.strip_prefix('.').unwrap_or(line));
            text.push('\n');
        }
        text
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            f.write_str(line)?;
        }
        Ok(())
    }
}
