use std::collections::HashMap;

use super::types::ChatMessage;

pub const CMD_CAP: &str = "CAP";
pub const CMD_NOTICE: &str = "NOTICE";
pub const CMD_PING: &str = "PING";
pub const CMD_PONG: &str = "PONG";
pub const CMD_PRIVMSG: &str = "PRIVMSG";
pub const CMD_RECONNECT: &str = "RECONNECT";
pub const RPL_WELCOME: &str = "001";

/// A protocol line split into its four sections.
///
/// Every field is a sub-slice of `line`; an absent section is the empty string.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage<'a> {
    pub line: &'a str,
    pub tags: &'a str,
    pub prefix: &'a str,
    pub command: &'a str,
    pub parameters: &'a str,
}

impl<'a> RawMessage<'a> {
    pub fn parse(line: &'a str) -> Self {
        let mut message = RawMessage {
            line,
            ..Default::default()
        };
        let mut remainder = line.trim_end_matches(['\r', '\n']);

        // The tag section runs up to the first " :"; the remainder starts at
        // that colon.
        if let Some(rest) = remainder.strip_prefix('@') {
            match rest.find(" :") {
                Some(end) => {
                    message.tags = &rest[..end];
                    remainder = &rest[end + 1..];
                }
                None => {
                    message.tags = rest;
                    return message;
                }
            }
        }

        if let Some(rest) = remainder.strip_prefix(':') {
            match rest.split_once(' ') {
                Some((prefix, rest)) => {
                    message.prefix = prefix;
                    remainder = rest.trim_start_matches(' ');
                }
                None => {
                    message.prefix = rest;
                    return message;
                }
            }
        }

        match remainder.split_once(' ') {
            Some((command, parameters)) => {
                message.command = command;
                message.parameters = parameters.trim_start_matches(' ');
            }
            None => message.command = remainder,
        }
        message
    }

    /// The trailing parameter: text after the ` :` marker, or the last
    /// space-separated token when the marker is missing.
    pub fn trailing(&self) -> Option<&'a str> {
        if let Some(trailing) = self.parameters.strip_prefix(':') {
            return Some(trailing);
        }
        match self.parameters.split_once(" :") {
            Some((_, trailing)) => Some(trailing),
            None => self.parameters.rsplit(' ').next().filter(|s| !s.is_empty()),
        }
    }
}

/// Tag key/value pairs borrowed from the tag section of a line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TagMap<'a> {
    entries: HashMap<&'a str, &'a str>,
}

impl<'a> TagMap<'a> {
    pub fn parse(tags: &'a str) -> Self {
        let mut entries = HashMap::new();
        for component in tags.split(';').filter(|c| !c.is_empty()) {
            let (key, value) = component.split_once('=').unwrap_or((component, ""));
            entries.entry(key).or_insert(value);
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.entries.get(key).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMessage<'a> {
    pub raw: RawMessage<'a>,
    pub payload: Option<&'a str>,
}

impl<'a> PingMessage<'a> {
    fn from_raw(raw: RawMessage<'a>) -> Self {
        let payload = raw.parameters.strip_prefix(':').unwrap_or(raw.parameters);
        Self {
            raw,
            payload: Some(payload).filter(|p| !p.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage<'a> {
    pub raw: RawMessage<'a>,
    pub sender: &'a str,
    pub channel: &'a str,
    pub body: &'a str,
    pub tags: TagMap<'a>,
}

impl<'a> PrivateMessage<'a> {
    /// Returns `None` when the parameters have neither a `:` marker nor a
    /// space to split the channel from the body.
    fn from_raw(raw: RawMessage<'a>) -> Option<Self> {
        let parameters = raw.parameters;
        // Without a ':' marker the last space is a guess: "#c a b" reads as
        // channel "c a", body "b".
        let separator = parameters.find(':').or_else(|| parameters.rfind(' '))?;

        let channel = parameters[..separator].trim();
        let channel = channel.strip_prefix('#').unwrap_or(channel);
        let body = &parameters[separator + 1..];
        let sender = raw
            .prefix
            .split_once('!')
            .map_or(raw.prefix, |(name, _)| name);

        Some(Self {
            raw,
            sender,
            channel,
            body,
            tags: TagMap::parse(raw.tags),
        })
    }

    pub fn is_action(&self) -> bool {
        is_action_body(self.body)
    }

    /// Copies the borrowed views so the message can leave the receive loop.
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            channel: self.channel.to_string(),
            sender: self.sender.to_string(),
            text: self.body.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedMessage<'a> {
    Raw(RawMessage<'a>),
    Ping(PingMessage<'a>),
    PrivateMessage(PrivateMessage<'a>),
}

pub fn parse(line: &str) -> ParsedMessage<'_> {
    let raw = RawMessage::parse(line);
    match raw.command {
        CMD_PRIVMSG => PrivateMessage::from_raw(raw)
            .map_or(ParsedMessage::Raw(raw), ParsedMessage::PrivateMessage),
        CMD_PING => ParsedMessage::Ping(PingMessage::from_raw(raw)),
        _ => ParsedMessage::Raw(raw),
    }
}

/// CTCP actions arrive as `\x01ACTION text\x01`.
pub fn is_action_body(body: &str) -> bool {
    body.strip_prefix('\u{1}')
        .unwrap_or(body)
        .starts_with("ACTION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn expect_privmsg(line: &str) -> PrivateMessage<'_> {
        match parse(line) {
            ParsedMessage::PrivateMessage(pm) => pm,
            other => panic!("expected PRIVMSG, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tagged_privmsg() {
        let pm = expect_privmsg("@id=1;user=bob :bob!bob@x PRIVMSG #chan :hello");
        assert_eq!(pm.sender, "bob");
        assert_eq!(pm.channel, "chan");
        assert_eq!(pm.body, "hello");
        assert_eq!(pm.tags.entries.len(), 2);
        assert_eq!(pm.tags.get("id"), Some("1"));
        assert_eq!(pm.tags.get("user"), Some("bob"));
    }

    #[test]
    fn test_parse_real_twitch_privmsg() {
        let line = "@badge-info=;badges=broadcaster/1;color=#FF0000;display-name=Alice;emotes=;id=abc-123;mod=0;subscriber=0;tmi-sent-ts=1700000000000;user-id=42 :alice!alice@alice.tmi.twitch.tv PRIVMSG #somechannel :Kappa this: has colons\r\n";
        let pm = expect_privmsg(line);
        assert_eq!(pm.sender, "alice");
        assert_eq!(pm.channel, "somechannel");
        assert_eq!(pm.body, "Kappa this: has colons");
        assert_eq!(pm.tags.get("badge-info"), Some(""));
        assert_eq!(pm.tags.get("color"), Some("#FF0000"));
        assert_eq!(pm.tags.get("display-name"), Some("Alice"));
        assert_eq!(pm.raw.prefix, "alice!alice@alice.tmi.twitch.tv");
    }

    #[test]
    fn test_parse_ping() {
        match parse("PING :abc123") {
            ParsedMessage::Ping(ping) => assert_eq!(ping.payload, Some("abc123")),
            other => panic!("expected PING, got {:?}", other),
        }
        match parse("PING") {
            ParsedMessage::Ping(ping) => assert_eq!(ping.payload, None),
            other => panic!("expected PING, got {:?}", other),
        }
        match parse("PING tmi.twitch.tv") {
            ParsedMessage::Ping(ping) => assert_eq!(ping.payload, Some("tmi.twitch.tv")),
            other => panic!("expected PING, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_command_is_raw() {
        match parse(":tmi.twitch.tv 001 sedbot :Welcome, GLHF!") {
            ParsedMessage::Raw(raw) => {
                assert_eq!(raw.tags, "");
                assert_eq!(raw.prefix, "tmi.twitch.tv");
                assert_eq!(raw.command, "001");
                assert_eq!(raw.parameters, "sedbot :Welcome, GLHF!");
                assert_eq!(raw.trailing(), Some("Welcome, GLHF!"));
            }
            other => panic!("expected raw, got {:?}", other),
        }
    }

    #[test]
    fn test_pong_trailing_token() {
        let raw = RawMessage::parse(":tmi.twitch.tv PONG tmi.twitch.tv :8812345");
        assert_eq!(raw.command, CMD_PONG);
        assert_eq!(raw.trailing(), Some("8812345"));

        let bare = RawMessage::parse("PONG 8812345");
        assert_eq!(bare.trailing(), Some("8812345"));
    }

    #[test]
    fn test_empty_and_degenerate_lines() {
        assert_eq!(parse(""), ParsedMessage::Raw(RawMessage::default()));

        // Tags with no terminator: everything after '@' is the tag section.
        match parse("@a=b;c=d") {
            ParsedMessage::Raw(raw) => {
                assert_eq!(raw.tags, "a=b;c=d");
                assert_eq!(raw.command, "");
            }
            other => panic!("expected raw, got {:?}", other),
        }

        // Prefix with nothing after it.
        match parse(":only.a.prefix") {
            ParsedMessage::Raw(raw) => {
                assert_eq!(raw.prefix, "only.a.prefix");
                assert_eq!(raw.command, "");
            }
            other => panic!("expected raw, got {:?}", other),
        }

        for line in ["@", ":", "@ ", ": ", " ", "@x :", "\r\n", "PRIVMSG", "PRIVMSG "] {
            let _ = parse(line);
        }
    }

    #[test]
    fn test_privmsg_without_separator_degrades_to_raw() {
        match parse(":bob!bob@x PRIVMSG #chan") {
            ParsedMessage::Raw(raw) => {
                assert_eq!(raw.command, CMD_PRIVMSG);
                assert_eq!(raw.parameters, "#chan");
            }
            other => panic!("expected raw, got {:?}", other),
        }
    }

    #[test]
    fn test_prefix_without_bang_uses_whole_prefix() {
        let pm = expect_privmsg(":justaname PRIVMSG #chan :hi");
        assert_eq!(pm.sender, "justaname");
    }

    #[test]
    fn test_missing_trailing_marker_uses_last_space() {
        let pm = expect_privmsg(":bob!bob@x PRIVMSG #chan hello");
        assert_eq!(pm.channel, "chan");
        assert_eq!(pm.body, "hello");

        // Ambiguous: with no ':' marker the split lands on the last space,
        // so extra words end up in the channel view.
        let pm = expect_privmsg(":bob!bob@x PRIVMSG #chan hello world");
        assert_eq!(pm.channel, "chan hello");
        assert_eq!(pm.body, "world");
    }

    #[test]
    fn test_tag_without_equals_and_trailing_semicolon() {
        let pm = expect_privmsg("@flag;key=value;; :bob!bob@x PRIVMSG #chan :hi");
        assert_eq!(pm.tags.entries.len(), 2);
        assert_eq!(pm.tags.get("flag"), Some(""));
        assert_eq!(pm.tags.get("key"), Some("value"));
    }

    #[test]
    fn test_duplicate_tag_keeps_first() {
        let tags = TagMap::parse("a=1;a=2");
        assert_eq!(tags.entries.len(), 1);
        assert_eq!(tags.get("a"), Some("1"));
    }

    #[test]
    fn test_tag_value_keeps_later_equals() {
        let tags = TagMap::parse("url=a=b");
        assert_eq!(tags.get("url"), Some("a=b"));
    }

    #[test]
    fn test_tags_end_at_space_colon() {
        // Without a prefix, the command is swallowed into the tag section up to
        // the first " :".
        match parse("@a=b PING :x") {
            ParsedMessage::Raw(raw) => {
                assert_eq!(raw.tags, "a=b PING");
                assert_eq!(raw.prefix, "x");
                assert_eq!(raw.command, "");
            }
            other => panic!("expected raw, got {:?}", other),
        }

        match parse("@a=b;c=d PRIVMSG #chan") {
            ParsedMessage::Raw(raw) => {
                assert_eq!(raw.tags, "a=b;c=d PRIVMSG #chan");
                assert_eq!(raw.command, "");
                assert_eq!(raw.parameters, "");
            }
            other => panic!("expected raw, got {:?}", other),
        }
    }

    #[test]
    fn test_views_borrow_from_line() {
        let line = String::from("@id=7 :bob!b@h PRIVMSG #chan :text");
        let pm = expect_privmsg(&line);
        let range = line.as_ptr() as usize..line.as_ptr() as usize + line.len();
        for view in [pm.raw.tags, pm.raw.prefix, pm.raw.command, pm.raw.parameters, pm.body] {
            assert!(range.contains(&(view.as_ptr() as usize)));
        }
    }

    #[test]
    fn test_action_detection() {
        assert!(expect_privmsg(":a!a@a PRIVMSG #c :\u{1}ACTION waves\u{1}").is_action());
        assert!(is_action_body("ACTION waves"));
        assert!(!is_action_body("no action here"));
    }

    #[test]
    fn test_to_chat_message_copies_views() {
        let chat = {
            let line = String::from("@id=9 :carol!c@h PRIVMSG #room :hey there");
            expect_privmsg(&line).to_chat_message()
        };
        assert_eq!(chat.sender, "carol");
        assert_eq!(chat.channel, "room");
        assert_eq!(chat.text, "hey there");
    }

    proptest! {
        #[test]
        fn parse_never_panics(line in "\\PC*") {
            let _ = parse(&line);
        }

        #[test]
        fn parse_never_panics_on_protocol_shaped_input(line in "[@:# !;=a-z0-9]{0,40}") {
            let _ = parse(&line);
        }

        #[test]
        fn tags_reconstruct_segment(
            tags in prop::collection::btree_map("[a-z][a-z0-9-]{0,8}", "[a-zA-Z0-9_/,]{0,8}", 1..8)
        ) {
            let segment = tags
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(";");
            let line = format!("@{segment} :bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :hi");

            let ParsedMessage::PrivateMessage(pm) = parse(&line) else {
                return Err(TestCaseError::fail("expected PRIVMSG"));
            };
            let recovered: BTreeMap<String, String> = pm
                .tags
                .entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let rejoined = recovered
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(";");
            prop_assert_eq!(&recovered, &tags);
            prop_assert_eq!(rejoined, segment);
        }
    }
}
