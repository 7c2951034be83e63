/* GS memory trace parser */

use anyhow::{anyhow, bail, Context, Result};

use librustgs::context::{BufferPos, DepthDescriptor, DrawRequest, LocalCopy};
use librustgs::format::psm;
use librustgs::target::ClutDescriptor;
use librustgs::{ByteRange, FrameDescriptor, TextureDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceOp {
    Write { addr: u32, data: Vec<u8> },
    Palette { offset: u32, data: Vec<u8> },
    Draw(DrawRequest),
    Fill { rgba: u32 },
    ReadBack(ByteRange),
    Copy(LocalCopy),
    Frame,
}

/// One operation per line. Blank lines and `#` comments are skipped.
pub fn parse(text: &str) -> Result<Vec<TraceOp>> {
    text.lines()
        .enumerate()
        .filter_map(|(n, line)| {
            let line = line.split('#').next().unwrap_or("").trim();
            (!line.is_empty()).then_some((n + 1, line))
        })
        .map(|(n, line)| parse_line(line).with_context(|| format!("line {}: '{}'", n, line)))
        .collect()
}

fn parse_line(line: &str) -> Result<TraceOp> {
    let mut tokens = line.split_whitespace();
    let op = tokens.next().unwrap_or_default();

    let parsed = match op {
        "write" => TraceOp::Write {
            addr: number(tokens.next(), "address")?,
            data: hex_bytes(tokens.next())?,
        },
        "palette" => TraceOp::Palette {
            offset: number(tokens.next(), "offset")?,
            data: hex_bytes(tokens.next())?,
        },
        "draw" => TraceOp::Draw(parse_draw(&mut tokens)?),
        "fill" => {
            let mut rgba = 0u32;
            for (shift, channel) in [(0, "red"), (8, "green"), (16, "blue"), (24, "alpha")] {
                let value = number(tokens.next(), channel)?;
                if value > 0xFF {
                    bail!("{} {} does not fit a byte", channel, value);
                }
                rgba |= value << shift;
            }
            TraceOp::Fill { rgba }
        }
        "readback" => {
            let start = number(tokens.next(), "start")?;
            let end = number(tokens.next(), "end")?;
            if end < start {
                bail!("read-back ends before it starts");
            }
            TraceOp::ReadBack(ByteRange::new(start, end))
        }
        "copy" => {
            let psm = pixel_format(tokens.next())?;
            let src = buffer(&mut tokens, "source")?;
            let dst = buffer(&mut tokens, "destination")?;
            TraceOp::Copy(LocalCopy {
                psm,
                src,
                dst,
                width: number(tokens.next(), "width")?,
                height: number(tokens.next(), "height")?,
            })
        }
        "frame" => TraceOp::Frame,
        other => bail!("unknown operation '{}'", other),
    };

    if let Some(extra) = tokens.next() {
        bail!("unexpected '{}'", extra);
    }
    Ok(parsed)
}

fn parse_draw<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<DrawRequest> {
    let frame = FrameDescriptor {
        psm: pixel_format(tokens.next())?,
        base: number(tokens.next(), "base")?,
        stride: number(tokens.next(), "stride")?,
        height: number(tokens.next(), "height")?,
        write_mask: 0,
    };

    let mut request = DrawRequest { context: 0, frame, depth: None, texture: None };
    let mut tokens = tokens.peekable();

    while let Some(&keyword) = tokens.peek() {
        match keyword {
            "depth" => {
                tokens.next();
                request.depth = Some(DepthDescriptor {
                    psm: pixel_format(tokens.next())?,
                    base: number(tokens.next(), "depth base")?,
                });
            }
            "tex" => {
                tokens.next();
                let mut texture = TextureDescriptor {
                    psm: pixel_format(tokens.next())?,
                    base: number(tokens.next(), "texture base")?,
                    stride: number(tokens.next(), "texture stride")?,
                    y: number(tokens.next(), "texture row")?,
                    height: number(tokens.next(), "texture height")?,
                    clut: None,
                };

                if tokens.peek() == Some(&"clut") {
                    tokens.next();
                    let cpsm = pixel_format(tokens.next())?;
                    let csa = number(tokens.next(), "clut offset")?;
                    if csa > 31 {
                        bail!("clut offset {} does not fit five bits", csa);
                    }
                    texture.clut = Some(ClutDescriptor { cpsm, csa });
                }
                request.texture = Some(texture);
            }
            "ctx" => {
                tokens.next();
                request.context = number(tokens.next(), "context")? as usize & 1;
            }
            other => bail!("unexpected '{}' in draw", other),
        }
    }

    Ok(request)
}

fn buffer<'a>(tokens: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<BufferPos> {
    Ok(BufferPos {
        base: number(tokens.next(), &format!("{} base", what))?,
        stride: number(tokens.next(), &format!("{} stride", what))?,
        x: 0,
        y: 0,
    })
}

fn number(token: Option<&str>, what: &str) -> Result<u32> {
    let token = token.ok_or_else(|| anyhow!("missing {}", what))?;
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.with_context(|| format!("bad {} '{}'", what, token))
}

fn pixel_format(token: Option<&str>) -> Result<u8> {
    let token = token.ok_or_else(|| anyhow!("missing pixel format"))?;
    let code = match token.to_ascii_uppercase().trim_start_matches("PSM") {
        "CT32" => psm::CT32,
        "CT24" => psm::CT24,
        "CT16" => psm::CT16,
        "CT16S" => psm::CT16S,
        "T8" => psm::T8,
        "T4" => psm::T4,
        "T8H" => psm::T8H,
        "T4HL" => psm::T4HL,
        "T4HH" => psm::T4HH,
        "Z32" => psm::Z32,
        "Z24" => psm::Z24,
        "Z16" => psm::Z16,
        "Z16S" => psm::Z16S,
        _ => {
            let code = number(Some(token), "pixel format")?;
            u8::try_from(code).with_context(|| format!("pixel format {} out of range", code))?
        }
    };
    Ok(code)
}

fn hex_bytes(token: Option<&str>) -> Result<Vec<u8>> {
    let token = token.ok_or_else(|| anyhow!("missing data"))?;
    if token.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }

    (0..token.len())
        .step_by(2)
        .map(|i| {
            let pair = token.get(i..i + 2).ok_or_else(|| anyhow!("bad hex data"))?;
            u8::from_str_radix(pair, 16).with_context(|| format!("bad hex byte '{}'", pair))
        })
        .collect()
}
