use anyhow::{Context, Result, anyhow, bail};
use bismo_core::capabilities::{CapabilityDescriptor, HW_REGISTERS};
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_while1};
use nom::character::complete::{char, digit1, hex_digit1, space0};
use nom::combinator::{all_consuming, map_res, opt, rest};
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

fn key(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn number(input: &str) -> IResult<&str, u64> {
    alt((
        map_res(preceded(tag_no_case("0x"), hex_digit1), |h| {
            u64::from_str_radix(h, 16)
        }),
        map_res(digit1, str::parse),
    ))(input)
}

fn entry(input: &str) -> IResult<&str, (&str, u64)> {
    separated_pair(key, delimited(space0, char('='), space0), number)(input)
}

/// An optional entry followed by an optional comment.
fn line(input: &str) -> IResult<&str, Option<(&str, u64)>> {
    terminated(
        preceded(space0, opt(entry)),
        pair(space0, opt(preceded(char('#'), rest))),
    )(input)
}

/// Parses a hardware configuration.
///
/// Every capability must appear exactly once. Unknown names, duplicates
/// and descriptors that fail the capability sanity checks are rejected.
pub fn parse_hwcfg(text: &str) -> Result<CapabilityDescriptor> {
    let mut caps = CapabilityDescriptor::zeroed();
    let mut seen = HashSet::new();

    for (lineno, raw) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let (_, parsed) = all_consuming(line)(raw.trim_end())
            .map_err(|_| anyhow!("line {}: expected `name = value`, got {:?}", lineno, raw))?;
        let Some((name, value)) = parsed else {
            continue;
        };
        let field = caps
            .field_mut(name)
            .ok_or_else(|| anyhow!("line {}: unknown capability {:?}", lineno, name))?;
        if !seen.insert(name) {
            bail!("line {}: {} given twice", lineno, name);
        }
        if u32::try_from(value).is_err() {
            bail!("line {}: {} = {} does not fit a 32-bit register", lineno, name, value);
        }
        *field = value;
    }

    let missing: Vec<&str> = HW_REGISTERS
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !seen.contains(name))
        .collect();
    if !missing.is_empty() {
        bail!("missing capabilities: {}", missing.join(", "));
    }

    caps.check()?;
    Ok(caps)
}

pub fn load_hwcfg<P: AsRef<Path>>(path: P) -> Result<CapabilityDescriptor> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read hardware config {}", path.display()))?;
    parse_hwcfg(&text).with_context(|| format!("Invalid hardware config {}", path.display()))
}

pub fn save_hwcfg<P: AsRef<Path>>(path: P, caps: &CapabilityDescriptor) -> Result<()> {
    let path = path.as_ref();
    let text = format!("# accelerator capabilities\n{}", caps);
    fs::write(path, text)
        .with_context(|| format!("Failed to write hardware config {}", path.display()))
}
