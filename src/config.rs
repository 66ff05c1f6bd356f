/*
 * Copyright (c) 2023 xvanc and contributors
 *
 * Redistribution and use in source and binary forms, with or without modification,
 * are permitted provided that the following conditions are met:
 *
 * 1. Redistributions of source code must retain the above copyright notice,
 *    this list of conditions and the following disclaimer.
 *
 * 2. Redistributions in binary form must reproduce the above copyright notice,
 *    this list of conditions and the following disclaimer in the documentation
 *    and/or other materials provided with the distribution.
 *
 * 3. Neither the name of the copyright holder nor the names of its contributors
 *    may be used to endorse or promote products derived from this software without
 *    specific prior written permission.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY
 * EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES
 * OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE DISCLAIMED.
 * IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT,
 * INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
 * PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS
 * INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
 * LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 *
 * SPDX-License-Identifier: BSD-3-Clause
 */

//! Platform configuration
//!
//! The configuration file uses a small block-structured format:
//!
//! ```text
//! // comment
//! log-level = "debug";
//! host-bridge "pci0" {
//!     ecam = 0x3000_0000;
//!     window "mmio" { start = 0x4000_0000; end = 0x7fff_ffff; }
//! }
//! ```

use crate::dma::DmaPolicy;
use alloc::{string::String, vec, vec::Vec};
use anyhow::{anyhow, bail, Context};
use core::{fmt, mem, ops::RangeInclusive, str::Chars};

/// A location within a source
#[derive(Clone, Copy, Debug)]
struct SourceLocation(u32, u32);

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0 + 1, self.1 + 1)
    }
}

#[derive(Clone, Copy, Debug)]
struct Token<'a> {
    location: (u32, u32),
    kind: TokenKind<'a>,
}

impl Token<'_> {
    /// Returns the location of the token in the source input
    ///
    /// The returned location is 0-indexed.
    const fn location(&self) -> SourceLocation {
        SourceLocation(self.location.0, self.location.1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TokenKind<'a> {
    Ident(&'a str),
    Number(&'a str),
    String(&'a str),
    Bool(bool),
    Semi,
    OpenBrace,
    CloseBrace,
    Eq,
    Comment,
}

impl fmt::Display for TokenKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Ident(_) => "ident",
            TokenKind::Number(_) => "number",
            TokenKind::String(_) => "string",
            TokenKind::Bool(_) => "bool",
            TokenKind::Semi => ";",
            TokenKind::OpenBrace => "{",
            TokenKind::CloseBrace => "}",
            TokenKind::Eq => "=",
            TokenKind::Comment => "comment",
        };
        write!(f, "{s}")
    }
}

struct Lexer<'src> {
    position: (u32, u32),
    input: Chars<'src>,
}

impl<'src> Lexer<'src> {
    fn new(input: &'src str) -> Lexer<'src> {
        Self {
            position: (0, 0),
            input: input.chars(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.input.next();
        if c == Some('\n') {
            self.position.0 += 1;
            self.position.1 = 0;
        } else {
            self.position.1 += 1;
        }
        c
    }

    fn first(&self) -> char {
        self.input.clone().next().unwrap_or('\0')
    }

    fn second(&self) -> char {
        self.input.clone().nth(1).unwrap_or('\0')
    }

    /// Consume characters while `pred` holds, returning the consumed slice
    fn eat_while(&mut self, pred: impl Fn(char) -> bool) -> &'src str {
        let start = self.input.as_str();
        let mut len = 0;
        while pred(self.first()) {
            len += self.first().len_utf8();
            if self.bump().is_none() {
                break;
            }
        }
        &start[..len]
    }

    fn next_token(&mut self) -> anyhow::Result<Option<Token<'src>>> {
        while self.first().is_whitespace() {
            self.bump();
        }

        let location = self.position;

        macro_rules! matchtok {
            ($kind:ident) => {{
                self.bump();
                TokenKind::$kind
            }};
        }

        let kind = match self.first() {
            ';' => matchtok!(Semi),
            '{' => matchtok!(OpenBrace),
            '}' => matchtok!(CloseBrace),
            '=' => matchtok!(Eq),
            '"' => {
                self.bump();
                let inner = self.eat_while(|c| c != '"' && c != '\0');
                if self.bump() != Some('"') {
                    bail!("{}: unterminated string", SourceLocation(location.0, location.1));
                }
                TokenKind::String(inner)
            }
            '_' | '-' | 'a'..='z' | 'A'..='Z' => {
                let ident =
                    self.eat_while(|c| matches!(c, '_' | '-' | 'a'..='z' | 'A'..='Z' | '0'..='9'));
                match ident {
                    "true" => TokenKind::Bool(true),
                    "false" => TokenKind::Bool(false),
                    ident => TokenKind::Ident(ident),
                }
            }
            '0'..='9' => {
                TokenKind::Number(self.eat_while(|c| c == '_' || c.is_ascii_alphanumeric()))
            }
            '/' if self.second() == '/' => {
                while !matches!(self.bump(), Some('\n') | None) {}
                TokenKind::Comment
            }
            '\0' => return Ok(None),
            unk => {
                let location = SourceLocation(location.0, location.1);
                bail!("{location}: unexpected character {unk:?}")
            }
        };

        Ok(Some(Token { location, kind }))
    }
}

#[derive(Debug)]
struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    index: usize,
}

impl<'src> Parser<'src> {
    fn parse_token(&mut self, expected: TokenKind) -> Option<Token<'src>> {
        let token = self.tokens.get(self.index)?;
        let found = token.kind;

        if mem::discriminant(&found) == mem::discriminant(&expected) {
            self.index += 1;
            Some(*token)
        } else {
            log::error!(
                "{}: expected `{expected}`, found `{found}`",
                token.location()
            );
            None
        }
    }

    fn parse_entry(&mut self, key: &'src str, name: Option<&'src str>) -> Option<Entry<'src>> {
        let mut params = vec![];
        let mut entries = vec![];

        loop {
            if matches!(
                self.tokens.get(self.index),
                None | Some(Token {
                    kind: TokenKind::CloseBrace,
                    ..
                })
            ) {
                break;
            }

            let token = self.tokens.get(self.index)?;
            let key = match token.kind {
                TokenKind::Ident(ident) => {
                    self.index += 1;
                    ident
                }
                kind => {
                    log::error!("{}: expected `ident`, found `{kind}`", token.location());
                    return None;
                }
            };

            let name = if let TokenKind::String(name) = self.tokens.get(self.index)?.kind {
                self.index += 1;
                Some(name)
            } else {
                None
            };

            let token = self.tokens.get(self.index)?;
            match token.kind {
                TokenKind::Eq if name.is_none() => {
                    self.index += 1;

                    let token = self.tokens.get(self.index)?;
                    let value = match token.kind {
                        TokenKind::Number(num) => Value::Number(num),
                        TokenKind::Bool(bool) => Value::Bool(bool),
                        TokenKind::String(str) => Value::String(str),
                        kind => {
                            log::error!("{}: expected `value`, found `{kind}`", token.location());
                            return None;
                        }
                    };
                    self.index += 1;

                    self.parse_token(TokenKind::Semi)?;
                    params.push(Param { key, value });
                }
                TokenKind::OpenBrace => {
                    self.index += 1;
                    let entry = self.parse_entry(key, name)?;
                    self.parse_token(TokenKind::CloseBrace)?;
                    entries.push(entry);
                }
                kind => {
                    log::error!("{}: unexpected `{kind}` after `{key}`", token.location());
                    return None;
                }
            }
        }

        Some(Entry {
            key,
            name,
            params,
            entries,
        })
    }
}

pub fn parse_config_file(input: &str) -> anyhow::Result<Entry<'_>> {
    let mut lexer = Lexer::new(input);
    let mut tokens = vec![];
    while let Some(token) = lexer.next_token()? {
        if token.kind != TokenKind::Comment {
            tokens.push(token);
        }
    }
    let mut parser = Parser { tokens, index: 0 };
    let entry = parser
        .parse_entry("<root>", None)
        .ok_or_else(|| anyhow!("malformed configuration file"))?;
    if parser.index != parser.tokens.len() {
        let token = parser.tokens[parser.index];
        bail!("{}: unexpected `{}`", token.location(), token.kind);
    }
    Ok(entry)
}

#[derive(Debug)]
pub struct Entry<'src> {
    pub key: &'src str,
    pub name: Option<&'src str>,
    pub params: Vec<Param<'src>>,
    pub entries: Vec<Entry<'src>>,
}

impl<'src> Entry<'src> {
    pub fn param(&self, key: &str) -> Option<&Value<'src>> {
        self.params.iter().find_map(|param| {
            if param.key == key {
                Some(&param.value)
            } else {
                None
            }
        })
    }

    /// Returns an iterator over all child entries with the given key
    pub fn entries<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Entry<'src>> + 'a {
        self.entries.iter().filter(move |entry| entry.key == key)
    }

    fn number(&self, key: &str) -> anyhow::Result<Option<u64>> {
        self.param(key)
            .map(|value| value.as_number().ok_or_else(|| anyhow!("`{key}` expects a number")))
            .transpose()
    }

    fn bool(&self, key: &str) -> anyhow::Result<Option<bool>> {
        match self.param(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => bail!("`{key}` expects a boolean"),
        }
    }

    fn string(&self, key: &str) -> anyhow::Result<Option<&'src str>> {
        match self.param(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(*s)),
            Some(_) => bail!("`{key}` expects a string"),
        }
    }

    fn range(&self) -> anyhow::Result<RangeInclusive<u64>> {
        let start = self.number("start")?.ok_or_else(|| anyhow!("missing `start`"))?;
        let end = self.number("end")?.ok_or_else(|| anyhow!("missing `end`"))?;
        if end < start {
            bail!("range end {end:#x} is below start {start:#x}");
        }
        Ok(start..=end)
    }

    fn warn_unknown(&self, known_params: &[&str], known_entries: &[&str]) {
        for param in &self.params {
            if !known_params.contains(&param.key) {
                log::warn!("config: ignoring unknown parameter `{}` in `{}`", param.key, self.key);
            }
        }
        for entry in &self.entries {
            if !known_entries.contains(&entry.key) {
                log::warn!("config: ignoring unknown entry `{}` in `{}`", entry.key, self.key);
            }
        }
    }
}

#[derive(Debug)]
pub struct Param<'src> {
    pub key: &'src str,
    pub value: Value<'src>,
}

/// A parameter value
#[derive(Debug)]
pub enum Value<'src> {
    /// A boolean
    Bool(bool),

    /// An integer in some base
    ///
    /// The contained string is the literal as written, use [`Value::as_number`] to
    /// get the value.
    Number(&'src str),

    /// A string
    String(&'src str),
}

impl Value<'_> {
    pub fn as_number(&self) -> Option<u64> {
        let Value::Number(literal) = self else { return None };
        parse_number(literal)
    }
}

/// Parse a numeric literal with an optional `0x`, `0o` or `0b` prefix
fn parse_number(literal: &str) -> Option<u64> {
    let digits: String = literal.chars().filter(|&c| c != '_').collect();
    let (radix, digits) = match digits.get(..2) {
        Some("0x" | "0X") => (16, &digits[2..]),
        Some("0o") => (8, &digits[2..]),
        Some("0b") => (2, &digits[2..]),
        _ => (10, &digits[..]),
    };
    u64::from_str_radix(digits, radix).ok()
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WindowConfig {
    pub kind: WindowKind,
    pub range: RangeInclusive<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WindowKind {
    Mmio,
    Prefetchable,
    Io,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostBridgeConfig {
    pub name: String,
    pub ecam: Option<u64>,
    pub bus_range: RangeInclusive<u8>,
    pub pcie: bool,
    pub windows: Vec<WindowConfig>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub log_level: log::LevelFilter,
    /// Discover PCI expansion ROMs as resources
    pub expansion_rom: bool,
    /// Program ACS isolation on PCI Express functions
    pub acs: bool,
    pub dma_policy: DmaPolicy,
    pub phys_bits: u32,
    pub io_alloc_base: u64,
    pub host_bridges: Vec<HostBridgeConfig>,
    /// Physical ranges withheld from allocation
    pub reserved: Vec<RangeInclusive<u64>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: log::LevelFilter::Info,
            expansion_rom: false,
            acs: true,
            dma_policy: DmaPolicy::Shared,
            phys_bits: 48,
            io_alloc_base: 0x1000,
            host_bridges: vec![],
            reserved: vec![],
        }
    }
}

impl Config {
    pub fn parse(input: &str) -> anyhow::Result<Config> {
        Self::from_entry(&parse_config_file(input)?)
    }

    pub fn from_entry(root: &Entry) -> anyhow::Result<Config> {
        root.warn_unknown(
            &[
                "log-level",
                "expansion-rom",
                "acs",
                "dma-domains",
                "phys-bits",
                "io-alloc-base",
            ],
            &["host-bridge", "reserve"],
        );

        let mut config = Config::default();

        if let Some(level) = root.string("log-level")? {
            config.log_level = level
                .parse()
                .map_err(|_| anyhow!("invalid log level `{level}`"))?;
        }
        if let Some(rom) = root.bool("expansion-rom")? {
            config.expansion_rom = rom;
        }
        if let Some(acs) = root.bool("acs")? {
            config.acs = acs;
        }
        match root.string("dma-domains")? {
            None => {}
            Some("shared") => config.dma_policy = DmaPolicy::Shared,
            Some("per-device") => config.dma_policy = DmaPolicy::PerDevice,
            Some(other) => bail!("unknown dma-domains policy `{other}`"),
        }
        if let Some(bits) = root.number("phys-bits")? {
            if !(32..=64).contains(&bits) {
                bail!("phys-bits must be between 32 and 64, got {bits}");
            }
            config.phys_bits = bits as u32;
        }
        if let Some(base) = root.number("io-alloc-base")? {
            if base > 0xffff {
                bail!("io-alloc-base {base:#x} is outside the I/O port space");
            }
            config.io_alloc_base = base;
        }

        for entry in root.entries("host-bridge") {
            let name = entry.name.unwrap_or("pci");
            let host = Self::host_bridge(entry, name)
                .with_context(|| alloc::format!("host-bridge \"{name}\""))?;
            config.host_bridges.push(host);
        }

        for entry in root.entries("reserve") {
            let range = entry
                .range()
                .with_context(|| alloc::format!("reserve \"{}\"", entry.name.unwrap_or("")))?;
            config.reserved.push(range);
        }

        Ok(config)
    }

    fn host_bridge(entry: &Entry, name: &str) -> anyhow::Result<HostBridgeConfig> {
        entry.warn_unknown(&["ecam", "bus-start", "bus-end", "pcie"], &["window"]);

        let bus = |key, default| -> anyhow::Result<u8> {
            let value = entry.number(key)?.unwrap_or(default);
            u8::try_from(value).map_err(|_| anyhow!("`{key}` value {value} overflows"))
        };
        let bus_range = bus("bus-start", 0)?..=bus("bus-end", 255)?;
        if bus_range.is_empty() {
            bail!("empty bus range {bus_range:?}");
        }

        let mut windows = vec![];
        for window in entry.entries("window") {
            let kind = match window.name {
                Some("mmio") => WindowKind::Mmio,
                Some("pref") => WindowKind::Prefetchable,
                Some("io") => WindowKind::Io,
                other => bail!("unknown window kind {other:?}"),
            };
            windows.push(WindowConfig {
                kind,
                range: window.range()?,
            });
        }

        Ok(HostBridgeConfig {
            name: name.into(),
            ecam: entry.number("ecam")?,
            bus_range,
            pcie: entry.bool("pcie")?.unwrap_or(true),
            windows,
        })
    }
}
