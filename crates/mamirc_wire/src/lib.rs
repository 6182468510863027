#![allow(clippy::write_with_newline)]

//! IRC wire protocol message parser and generators. Incomplete; messages are added as the session
//! machine needs them.
//!
//! This library is for implementing clients rather than servers or services, and does not support
//! the IRC message format in full generality. Line framing is done upstream (the connector splits
//! the byte stream on CR/LF/CR+LF), so the parser here takes one line without its terminator.

use mamirc_common::{IrcName, IrcNameRef};

//
// Message generators. None of these append the trailing "\r\n"; the connector's writer adds it.
//

pub fn nick(arg: &str) -> String {
    format!("NICK {}", arg)
}

pub fn user(username: &str, realname: &str) -> String {
    format!("USER {} 0 * :{}", username, realname)
}

pub fn join(chan: &IrcNameRef, key: Option<&str>) -> String {
    match key {
        None => format!("JOIN {}", chan.display()),
        Some(key) => format!("JOIN {} {}", chan.display(), key),
    }
}

pub fn privmsg(msgtarget: &str, msg: &str) -> String {
    format!("PRIVMSG {} :{}", msgtarget, msg)
}

pub fn pong(arg: &str) -> String {
    format!("PONG {}", arg)
}

pub fn names(chan: &IrcNameRef) -> String {
    format!("NAMES {}", chan.display())
}

/// Sender of a message ("prefix" in the RFC). Parsed instead of kept as a `String` because users
/// need to distinguish a server from a user: a PRIVMSG from a server goes to the server window,
/// one from a user to the sender's window.
///
/// (The ambiguity in the RFC makes this a best-effort thing. When we get a PRIVMSG from e.g.
/// "foo" it's not possible to know whether "foo" is a server or a user.)
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Pfx {
    /// Sender is a server.
    Server(String),

    /// Sender is a nick.
    User {
        /// Nick of the sender
        nick: String,
        /// `user@host` part
        user: String,
    },

    /// Sender could be a server or a nick. According to the RFC if we have something like
    /// "localhost" which doesn't have '!', '@', or a character that 'servername' can have but
    /// 'nickname' cannot, we can't tell which it is.
    Ambiguous(String),
}

impl Pfx {
    /// The nick of the sender, when the sender can be a user. Ambiguous prefixes are interpreted
    /// as nicks, as bouncers commonly send user messages without a `user@host` part.
    pub fn nick(&self) -> Option<&str> {
        match self {
            Pfx::User { nick, .. } | Pfx::Ambiguous(nick) => Some(nick),
            Pfx::Server(_) => None,
        }
    }
}

// RFC 2812 section 2.3.1
fn parse_pfx(pfx: &str) -> Pfx {
    match pfx.find(['!', '@']) {
        Some(idx) => Pfx::User {
            nick: pfx[0..idx].to_owned(),
            user: pfx[idx + 1..].to_owned(),
        },
        None => {
            // Chars that nicks can have but servernames cannot
            match pfx.find(['[', ']', '\\', '`', '_', '^', '{', '|', '}']) {
                Some(_) => Pfx::User {
                    nick: pfx.to_owned(),
                    user: "".to_owned(),
                },
                None => {
                    // Nicks can't have '.'
                    match pfx.find('.') {
                        Some(_) => Pfx::Server(pfx.to_owned()),
                        None => Pfx::Ambiguous(pfx.to_owned()),
                    }
                }
            }
        }
    }
}

/// Target of a PRIVMSG or NOTICE. If the target starts with '#' or '&' it's a channel, otherwise
/// a user.
#[derive(Debug, PartialEq, Eq)]
pub enum MsgTarget {
    Chan(IrcName),
    User(String),
}

/// An IRC message
#[derive(Debug, PartialEq, Eq)]
pub struct Msg {
    /// Sender of the message. According to RFC 2812 it's optional:
    ///
    /// > If the prefix is missing from the message, it is assumed to have originated from the
    /// > connection from which it was received from.
    pub pfx: Option<Pfx>,
    pub cmd: Cmd,
}

/// An IRC command or reply
#[derive(Debug, PartialEq, Eq)]
pub enum Cmd {
    /// A PRIVMSG or NOTICE. Check `is_notice` field.
    PRIVMSG {
        target: MsgTarget,
        msg: String,
        is_notice: bool,
    },

    JOIN {
        chan: IrcName,
    },

    PART {
        chan: IrcName,
        msg: Option<String>,
    },

    KICK {
        chan: IrcName,
        nick: String,
        msg: Option<String>,
    },

    QUIT {
        msg: Option<String>,
    },

    NICK {
        nick: String,
    },

    MODE {
        /// A channel name or a nickname.
        target: String,
        /// Mode string and its arguments, in order.
        params: Vec<String>,
    },

    TOPIC {
        chan: IrcName,
        topic: String,
    },

    PING {
        server: String,
    },

    PONG {
        server: String,
    },

    ERROR {
        msg: String,
    },

    /// An IRC message other than the ones listed above.
    Other {
        cmd: String,
        params: Vec<String>,
    },

    /// Numeric replies are kept generic as there are just too many replies and we only need to
    /// handle a small subset of them.
    Reply {
        num: u16,
        params: Vec<String>,
    },
}

/// An intermediate type used during parsing.
enum MsgType<'a> {
    Cmd(&'a str),
    Num(u16),
}

/// Parse one IRC message. `msg` must not contain the line terminator.
pub fn parse_line(mut msg: &str) -> Result<Msg, String> {
    let pfx: Option<Pfx> = {
        if let Some(':') = msg.chars().next() {
            // parse prefix
            let ws_idx = msg
                .find(' ')
                .ok_or(format!("Can't find prefix terminator (' ') in msg: {:?}", msg))?;
            let pfx = &msg[1..ws_idx]; // consume ':'
            msg = &msg[ws_idx + 1..]; // consume ' '
            Some(parse_pfx(pfx))
        } else {
            None
        }
    };

    let msg_ty: MsgType = {
        match msg.find(' ') {
            Some(ws_idx) => {
                let cmd = &msg[..ws_idx];
                msg = &msg[ws_idx + 1..]; // consume ' '
                match cmd.parse::<u16>() {
                    Ok(num) => MsgType::Num(num),
                    Err(_) => MsgType::Cmd(cmd),
                }
            }
            None => {
                // A command with no parameters, e.g. a bare "QUIT"
                let cmd = msg;
                msg = "";
                match cmd.parse::<u16>() {
                    Ok(num) => MsgType::Num(num),
                    Err(_) => MsgType::Cmd(cmd),
                }
            }
        }
    };

    let params = parse_params(msg);
    let cmd = match msg_ty {
        MsgType::Cmd("PRIVMSG") | MsgType::Cmd("NOTICE") if params.len() == 2 => {
            let is_notice = matches!(msg_ty, MsgType::Cmd("NOTICE"));
            let target = params[0];
            let target = if IrcNameRef::new(target).is_chan() {
                MsgTarget::Chan(IrcName::new(target.to_owned()))
            } else {
                MsgTarget::User(target.to_owned())
            };
            Cmd::PRIVMSG {
                target,
                msg: params[1].to_owned(),
                is_notice,
            }
        }
        MsgType::Cmd("JOIN") if !params.is_empty() => Cmd::JOIN {
            chan: IrcName::new(params[0].to_owned()),
        },
        MsgType::Cmd("PART") if params.len() == 1 || params.len() == 2 => Cmd::PART {
            chan: IrcName::new(params[0].to_owned()),
            msg: params.get(1).map(|s| (*s).to_owned()),
        },
        MsgType::Cmd("KICK") if params.len() == 2 || params.len() == 3 => Cmd::KICK {
            chan: IrcName::new(params[0].to_owned()),
            nick: params[1].to_owned(),
            msg: params.get(2).map(|s| (*s).to_owned()),
        },
        MsgType::Cmd("QUIT") if params.len() <= 1 => Cmd::QUIT {
            msg: params.first().map(|s| (*s).to_owned()),
        },
        MsgType::Cmd("NICK") if params.len() == 1 => Cmd::NICK {
            nick: params[0].to_owned(),
        },
        MsgType::Cmd("MODE") if !params.is_empty() => Cmd::MODE {
            target: params[0].to_owned(),
            params: params[1..].iter().map(|s| (*s).to_owned()).collect(),
        },
        MsgType::Cmd("TOPIC") if params.len() == 2 => Cmd::TOPIC {
            chan: IrcName::new(params[0].to_owned()),
            topic: params[1].to_owned(),
        },
        MsgType::Cmd("PING") if !params.is_empty() => Cmd::PING {
            server: params[0].to_owned(),
        },
        MsgType::Cmd("PONG") if !params.is_empty() => Cmd::PONG {
            server: params[0].to_owned(),
        },
        MsgType::Cmd("ERROR") if params.len() == 1 => Cmd::ERROR {
            msg: params[0].to_owned(),
        },
        MsgType::Num(n) => Cmd::Reply {
            num: n,
            params: params.into_iter().map(|s| s.to_owned()).collect(),
        },
        MsgType::Cmd(cmd) => Cmd::Other {
            cmd: cmd.to_owned(),
            params: params.into_iter().map(|s| s.to_owned()).collect(),
        },
    };

    Ok(Msg { pfx, cmd })
}

fn parse_params(chrs: &str) -> Vec<&str> {
    // RFC 2812:
    //
    //     params     =  *14( SPACE middle ) [ SPACE ":" trailing ]
    //                =/ 14( SPACE middle ) [ SPACE [ ":" ] trailing ]
    //
    //     nospcrlfcl =  %x01-09 / %x0B-0C / %x0E-1F / %x21-39 / %x3B-FF
    //                     ; any octet except NUL, CR, LF, " " and ":"
    //     middle     =  nospcrlfcl *( ":" / nospcrlfcl )
    //     trailing   =  *( ":" / " " / nospcrlfcl )

    let mut params = Vec::new();
    let mut char_indices = chrs.char_indices();

    while let Some((idx, c)) = char_indices.next() {
        if c == ':' {
            params.push(&chrs[idx + 1..]); // Skip ':'
            break;
        }

        if params.len() == 14 {
            params.push(&chrs[idx..]);
            break;
        }

        if c == ' ' {
            continue;
        }

        loop {
            match char_indices.next() {
                Some((idx_, c)) => {
                    if c == ' ' {
                        params.push(&chrs[idx..idx_]);
                        break;
                    }
                }
                None => {
                    params.push(&chrs[idx..]);
                    break;
                }
            }
        }
    }

    params
}

/// Nicks may have prefixes, indicating the user is an operator, founder, or something else.
///
/// Channel membership prefixes: http://modern.ircdocs.horse/#channel-membership-prefixes
///
/// Returns the nick without prefix.
pub fn drop_nick_prefix(nick: &str) -> &str {
    static PREFIXES: [char; 6] = ['~', '&', '@', '%', '+', '!'];

    match nick.chars().next() {
        Some(c) if PREFIXES.contains(&c) => &nick[1..],
        _ => nick,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params("p1 p2 p3"), vec!["p1", "p2", "p3"]);
        let empty: Vec<&str> = vec![];
        assert_eq!(parse_params(""), empty);
        assert_eq!(parse_params(":foo bar baz "), vec!["foo bar baz "]);
        assert_eq!(parse_params(":"), vec![""]);
        assert_eq!(parse_params("x:y"), vec!["x:y"]);

        let params = parse_params("1 2 3 4 5 6 7 8 9 10 11 12 13 14 blah blah blah");
        assert_eq!(params.len(), 15);
        assert_eq!(params[params.len() - 1], "blah blah blah");
    }

    #[test]
    fn test_privmsg_parsing() {
        assert_eq!(
            parse_line(":nick!~nick@unaffiliated/nick PRIVMSG target :a b c").unwrap(),
            Msg {
                pfx: Some(Pfx::User {
                    nick: "nick".to_owned(),
                    user: "~nick@unaffiliated/nick".to_owned(),
                }),
                cmd: Cmd::PRIVMSG {
                    target: MsgTarget::User("target".to_owned()),
                    msg: "a b c".to_owned(),
                    is_notice: false,
                },
            }
        );
    }

    #[test]
    fn test_notice_parsing() {
        assert_eq!(
            parse_line(":services.example.net NOTICE * :*** Looking up your hostname...").unwrap(),
            Msg {
                pfx: Some(Pfx::Server("services.example.net".to_owned())),
                cmd: Cmd::PRIVMSG {
                    target: MsgTarget::User("*".to_owned()),
                    msg: "*** Looking up your hostname...".to_owned(),
                    is_notice: true,
                },
            }
        );
    }

    #[test]
    fn test_chan_target_parsing() {
        match parse_line(":a!b@c PRIVMSG #chan :hi").unwrap().cmd {
            Cmd::PRIVMSG {
                target: MsgTarget::Chan(chan),
                ..
            } => assert_eq!(chan.display(), "#chan"),
            cmd => panic!("unexpected cmd: {:?}", cmd),
        }
        // '&' channels too
        match parse_line(":a!b@c PRIVMSG &local :hi").unwrap().cmd {
            Cmd::PRIVMSG {
                target: MsgTarget::Chan(_),
                ..
            } => {}
            cmd => panic!("unexpected cmd: {:?}", cmd),
        }
    }

    #[test]
    fn test_join_part_parsing() {
        assert_eq!(
            parse_line(":osa!~o@h JOIN #rust").unwrap().cmd,
            Cmd::JOIN {
                chan: IrcName::new("#rust".to_owned()),
            }
        );
        assert_eq!(
            parse_line(":osa!~o@h PART #rust :bye").unwrap().cmd,
            Cmd::PART {
                chan: IrcName::new("#rust".to_owned()),
                msg: Some("bye".to_owned()),
            }
        );
    }

    #[test]
    fn test_kick_parsing() {
        assert_eq!(
            parse_line(":op!~o@h KICK #rust loudguy :spam").unwrap().cmd,
            Cmd::KICK {
                chan: IrcName::new("#rust".to_owned()),
                nick: "loudguy".to_owned(),
                msg: Some("spam".to_owned()),
            }
        );
        assert_eq!(
            parse_line(":op!~o@h KICK #rust loudguy").unwrap().cmd,
            Cmd::KICK {
                chan: IrcName::new("#rust".to_owned()),
                nick: "loudguy".to_owned(),
                msg: None,
            }
        );
    }

    #[test]
    fn test_quit_parsing() {
        assert_eq!(
            parse_line(":x!y@z QUIT :Ping timeout").unwrap().cmd,
            Cmd::QUIT {
                msg: Some("Ping timeout".to_owned()),
            }
        );
        // Bare QUIT, no params at all
        assert_eq!(parse_line(":x!y@z QUIT").unwrap().cmd, Cmd::QUIT { msg: None });
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            parse_line(":op!~o@h MODE #rust +o somenick").unwrap().cmd,
            Cmd::MODE {
                target: "#rust".to_owned(),
                params: vec!["+o".to_owned(), "somenick".to_owned()],
            }
        );
        assert_eq!(
            parse_line(":srv.example.net MODE mynick :+i").unwrap().cmd,
            Cmd::MODE {
                target: "mynick".to_owned(),
                params: vec!["+i".to_owned()],
            }
        );
    }

    #[test]
    fn test_numeric_parsing() {
        let msg = parse_line(":srv.example.net 001 alice :Welcome to the network alice").unwrap();
        assert_eq!(msg.pfx, Some(Pfx::Server("srv.example.net".to_owned())));
        assert_eq!(
            msg.cmd,
            Cmd::Reply {
                num: 1,
                params: vec!["alice".to_owned(), "Welcome to the network alice".to_owned()],
            }
        );
    }

    #[test]
    fn test_error_parsing() {
        assert_eq!(
            parse_line("ERROR :Closing Link: 203.0.113.51 (Excess Flood)").unwrap(),
            Msg {
                pfx: None,
                cmd: Cmd::ERROR {
                    msg: "Closing Link: 203.0.113.51 (Excess Flood)".to_owned(),
                },
            },
        );
    }

    #[test]
    fn test_parse_pfx() {
        use Pfx::*;
        assert_eq!(parse_pfx("xyz"), Ambiguous("xyz".to_string()));
        assert_eq!(parse_pfx("xy.z"), Server("xy.z".to_string()));
        assert_eq!(
            parse_pfx("xyz[m]"),
            User {
                nick: "xyz[m]".to_string(),
                user: "".to_string()
            }
        );
        assert_eq!(
            parse_pfx("osa1!osa1@x.y.im"),
            User {
                nick: "osa1".to_string(),
                user: "osa1@x.y.im".to_string(),
            }
        );
    }

    #[test]
    fn test_drop_nick_prefix() {
        assert_eq!(drop_nick_prefix("@op"), "op");
        assert_eq!(drop_nick_prefix("+voiced"), "voiced");
        assert_eq!(drop_nick_prefix("!special"), "special");
        assert_eq!(drop_nick_prefix("plain"), "plain");
        assert_eq!(drop_nick_prefix(""), "");
    }

    #[test]
    fn test_generators() {
        assert_eq!(nick("alice"), "NICK alice");
        assert_eq!(user("alice", "Alice A"), "USER alice 0 * :Alice A");
        assert_eq!(join(IrcNameRef::new("#rust"), None), "JOIN #rust");
        assert_eq!(join(IrcNameRef::new("#sec"), Some("hunter2")), "JOIN #sec hunter2");
        assert_eq!(privmsg("NickServ", "identify pw"), "PRIVMSG NickServ :identify pw");
        assert_eq!(pong("srv"), "PONG srv");
        assert_eq!(names(IrcNameRef::new("#rust")), "NAMES #rust");
    }
}
