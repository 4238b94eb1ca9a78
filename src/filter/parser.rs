use std::collections::HashMap;
use std::net::IpAddr;

use lazy_static::lazy_static;

use super::{Expr, FilterError, Proto, Qualifier};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    LParen,
    RParen,
    Bang,
    AndAnd,
    OrOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    Proto(Proto),
    Src,
    Dst,
    Host,
    Net,
    Port,
    PortRange,
    And,
    Or,
    Not,
}

lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, Keyword> = {
        let mut m = HashMap::new();
        m.insert("ip", Keyword::Proto(Proto::Ip));
        m.insert("ip6", Keyword::Proto(Proto::Ip6));
        m.insert("tcp", Keyword::Proto(Proto::Tcp));
        m.insert("udp", Keyword::Proto(Proto::Udp));
        m.insert("icmp", Keyword::Proto(Proto::Icmp));
        m.insert("vlan", Keyword::Proto(Proto::Vlan));
        m.insert("src", Keyword::Src);
        m.insert("dst", Keyword::Dst);
        m.insert("host", Keyword::Host);
        m.insert("net", Keyword::Net);
        m.insert("port", Keyword::Port);
        m.insert("portrange", Keyword::PortRange);
        m.insert("and", Keyword::And);
        m.insert("or", Keyword::Or);
        m.insert("not", Keyword::Not);
        m
    };
}

fn tokenize(src: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Bang);
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(c) {
                    return Err(FilterError::BadChar(c));
                }
                tokens.push(if c == '&' { Token::AndAnd } else { Token::OrOr });
            }
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '-' | '_') => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '-' | '_') {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            other => return Err(FilterError::BadChar(other)),
        }
    }

    Ok(tokens)
}

pub fn parse(src: &str) -> Result<Expr, FilterError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Ok(Expr::Any);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    match parser.next() {
        None => Ok(expr),
        Some(t) => Err(FilterError::UnexpectedToken(describe(&t))),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Word(w) => w.clone(),
        Token::LParen => "(".into(),
        Token::RParen => ")".into(),
        Token::Bang => "!".into(),
        Token::AndAnd => "&&".into(),
        Token::OrOr => "||".into(),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn peek_keyword(&self) -> Option<Keyword> {
        match self.peek()? {
            Token::Word(w) => KEYWORDS.get(w.as_str()).copied(),
            Token::AndAnd => Some(Keyword::And),
            Token::OrOr => Some(Keyword::Or),
            Token::Bang => Some(Keyword::Not),
            _ => None,
        }
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword() == Some(Keyword::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_unary()?;
        while self.peek_keyword() == Some(Keyword::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, FilterError> {
        if self.peek_keyword() == Some(Keyword::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, FilterError> {
        let token = self.next().ok_or(FilterError::UnexpectedEnd)?;
        let word = match token {
            Token::LParen => {
                let inner = self.parse_or()?;
                return match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(t) => Err(FilterError::UnexpectedToken(describe(&t))),
                    None => Err(FilterError::UnexpectedEnd),
                };
            }
            Token::Word(w) => w,
            other => return Err(FilterError::UnexpectedToken(describe(&other))),
        };

        match KEYWORDS.get(word.as_str()).copied() {
            Some(Keyword::Proto(p)) => Ok(Expr::Proto(p)),
            Some(Keyword::Src) => self.parse_qualified(Qualifier::Src),
            Some(Keyword::Dst) => self.parse_qualified(Qualifier::Dst),
            Some(kw @ (Keyword::Host | Keyword::Net | Keyword::Port | Keyword::PortRange)) => {
                self.parse_primitive(Qualifier::Either, kw)
            }
            _ => Err(FilterError::UnexpectedToken(word)),
        }
    }

    fn parse_qualified(&mut self, q: Qualifier) -> Result<Expr, FilterError> {
        match self.next() {
            Some(Token::Word(w)) => match KEYWORDS.get(w.as_str()).copied() {
                Some(kw @ (Keyword::Host | Keyword::Net | Keyword::Port | Keyword::PortRange)) => {
                    self.parse_primitive(q, kw)
                }
                _ => Err(FilterError::UnexpectedToken(w)),
            },
            Some(t) => Err(FilterError::UnexpectedToken(describe(&t))),
            None => Err(FilterError::UnexpectedEnd),
        }
    }

    fn parse_primitive(&mut self, q: Qualifier, kw: Keyword) -> Result<Expr, FilterError> {
        let arg = match self.next() {
            Some(Token::Word(w)) => w,
            Some(t) => return Err(FilterError::UnexpectedToken(describe(&t))),
            None => return Err(FilterError::UnexpectedEnd),
        };

        match kw {
            Keyword::Host => {
                let addr: IpAddr = arg.parse().map_err(|_| FilterError::BadAddress(arg.clone()))?;
                Ok(Expr::Host(q, addr))
            }
            Keyword::Net => {
                let (addr, prefix) = parse_net(&arg)?;
                Ok(Expr::Net(q, addr, prefix))
            }
            Keyword::Port => {
                let port = parse_port(&arg)?;
                Ok(Expr::Port(q, port, port))
            }
            _ => {
                let (lo, hi) = arg
                    .split_once('-')
                    .ok_or_else(|| FilterError::BadPort(arg.clone()))?;
                let (lo, hi) = (parse_port(lo)?, parse_port(hi)?);
                if lo > hi {
                    return Err(FilterError::BadPort(arg));
                }
                Ok(Expr::Port(q, lo, hi))
            }
        }
    }
}

fn parse_port(s: &str) -> Result<u16, FilterError> {
    s.parse().map_err(|_| FilterError::BadPort(s.to_string()))
}

fn parse_net(s: &str) -> Result<(IpAddr, u8), FilterError> {
    let bad = || FilterError::BadNet(s.to_string());
    let (addr, prefix) = match s.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (s, None),
    };
    let addr: IpAddr = addr.parse().map_err(|_| bad())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p.parse::<u8>().map_err(|_| bad())?,
        None => max,
    };
    if prefix > max {
        return Err(bad());
    }
    Ok((addr, prefix))
}
