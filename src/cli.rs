// ============================================================================
// PaintCore CLI — headless drawing via a command script
// ============================================================================
//
// Usage examples:
//   paintcore --width 64 --height 64 --script ops.txt --output out.png
//   paintcore --input sketch.pcp --script touchup.txt --project sketch.pcp
//   paintcore -i photo.png -s recolor.txt -o recolored.jpg --quality 85
//
// Script format: one command per line; `#` lines and ` # ` tails are
// comments.  Points are written `x,y`.  See `Command::parse` for the full grammar.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::blend::BlendMode;
use crate::color::Color;
use crate::components::tools::{BrushShape, DitherPattern, GradientType};
use crate::error::{EngineError, Result};
use crate::ops::transform::{Anchor, Interpolation};
use crate::project::{Button, Project, StrokeKind};
use crate::settings::EngineSettings;
use crate::{log_err, log_info, log_warn};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// PaintCore headless drawing engine.
///
/// Runs a text script of brush, selection, layer and canvas commands against
/// a new or loaded canvas, then writes the result.
#[derive(Parser, Debug)]
#[command(
    name = "paintcore",
    about = "PaintCore headless drawing engine",
    long_about = "Run a script of drawing commands against a canvas without a GUI.\n\
                  Inputs may be .pcp projects or PNG/JPEG/BMP/TGA images.\n\n\
                  Example:\n  \
                  paintcore --width 32 --height 32 --script ops.txt --output out.png"
)]
pub struct CliArgs {
    /// Width of a new canvas (ignored with --input).
    #[arg(long, default_value_t = 64)]
    pub width: u32,

    /// Height of a new canvas (ignored with --input).
    #[arg(long, default_value_t = 64)]
    pub height: u32,

    /// Project (.pcp) or image to start from instead of a blank canvas.
    #[arg(short, long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Command script to run.
    #[arg(short, long, value_name = "SCRIPT")]
    pub script: Option<PathBuf>,

    /// Write the composite of the current frame (format from extension).
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Save the layered result as a .pcp project.
    #[arg(short, long, value_name = "FILE.pcp")]
    pub project: Option<PathBuf>,

    /// JPEG quality (1–100).
    #[arg(short, long, default_value_t = 90, value_name = "1-100")]
    pub quality: u8,

    /// Session log location (default: platform data directory).
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Stop at the first rejected command instead of skipping it.
    #[arg(long)]
    pub strict: bool,

    /// Print each command and timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the CLI and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    let start = Instant::now();
    let settings = EngineSettings::load();

    let mut project = match &args.input {
        Some(path) => match Project::open(path, settings) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("error: could not open '{}': {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Project::new_untitled(1, args.width, args.height, settings),
    };

    if let Some(path) = &args.script {
        let source = match std::fs::read_to_string(path) {
            Ok(src) => src,
            Err(e) => {
                eprintln!("error: could not read script '{}': {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        };
        match run_script(&mut project, &source, args.strict, args.verbose) {
            Ok(report) => {
                for warning in &report.warnings {
                    eprintln!("warning: {}", warning);
                }
                if args.verbose {
                    println!("{} command(s) executed, {} skipped", report.executed, report.warnings.len());
                }
            }
            Err(e) => {
                log_err!("Script '{}' failed: {}", path.display(), e);
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    if let Some(out) = &args.output {
        if let Err(e) = project.export_image(out, args.quality) {
            eprintln!("error: export to '{}' failed: {}", out.display(), e);
            return ExitCode::FAILURE;
        }
        if args.verbose {
            println!("  → {}", out.display());
        }
    }

    if let Some(pcp) = &args.project {
        if let Err(e) = project.save(Some(pcp)) {
            eprintln!("error: saving project '{}' failed: {}", pcp.display(), e);
            return ExitCode::FAILURE;
        }
        if args.verbose {
            println!("  → {}", pcp.display());
        }
    }

    if args.verbose {
        println!("done ({:.0}ms)", start.elapsed().as_secs_f64() * 1000.0);
    }
    ExitCode::SUCCESS
}

// ============================================================================
// Script commands
// ============================================================================

type Point = (i32, i32);

#[derive(Clone, Debug, PartialEq)]
pub enum LayerCommand {
    Add,
    Delete(Option<usize>),
    Duplicate(Option<usize>),
    Move { from: usize, to: usize },
    Select(usize),
    Opacity(usize, f32),
    Visible(usize, bool),
    Blend(usize, BlendMode),
    Rename(usize, String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameCommand {
    Add,
    Duplicate,
    Delete(Option<usize>),
    Select(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Color { button: Button, color: Color },
    Size(u32),
    Shape(BrushShape),
    Blend { mode: BlendMode, opacity: Option<f32> },
    Stroke { kind: StrokeKind, button: Button, points: Vec<Point> },
    Line { p1: Point, p2: Point, button: Button },
    Fill { pos: Point, threshold: f32, diagonal: bool, merge: bool, button: Button },
    Gradient { p1: Point, p2: Point, kind: GradientType },
    Replace { pos: Point, all_layers: bool, all_frames: bool, ignore_opacity: bool },
    Sample { pos: Point, ignore_opacity: bool, merge: bool, button: Button },
    SelectRect { p1: Point, p2: Point },
    SelectAll,
    Deselect,
    Magic { pos: Point, threshold: f32, diagonal: bool, merge: bool },
    Move { dx: i32, dy: i32 },
    Rotate { degrees: f32, interpolate: bool, ignore_empty: bool },
    Commit,
    Cancel,
    Layer(LayerCommand),
    Frame(FrameCommand),
    Undo(usize),
    Redo(usize),
    Flip { horizontal: bool },
    RotateCanvas(i32),
    ResizeImage { width: u32, height: u32, interp: Interpolation },
    ResizeCanvas { width: u32, height: u32, anchor: Anchor },
}

fn parse_point(tok: &str) -> Result<Point> {
    let (x, y) = tok
        .split_once(',')
        .ok_or_else(|| EngineError::format(format!("expected x,y but found '{}'", tok)))?;
    let x = x.trim().parse().map_err(|_| EngineError::format(format!("bad x coordinate in '{}'", tok)))?;
    let y = y.trim().parse().map_err(|_| EngineError::format(format!("bad y coordinate in '{}'", tok)))?;
    Ok((x, y))
}

fn parse_num<T: std::str::FromStr>(tok: &str, what: &str) -> Result<T> {
    tok.parse().map_err(|_| EngineError::format(format!("bad {} '{}'", what, tok)))
}

fn arg<'a>(args: &[&'a str], i: usize, what: &str) -> Result<&'a str> {
    args.get(i).copied().ok_or_else(|| EngineError::format(format!("missing {}", what)))
}

/// Split trailing words into flags and the first numeric value.
fn flags_and_threshold(rest: &[&str], allowed: &[&str]) -> Result<(Vec<String>, Option<f32>)> {
    let mut flags = Vec::new();
    let mut threshold = None;
    for tok in rest {
        if let Ok(v) = tok.parse::<f32>() {
            threshold = Some(v);
        } else if allowed.contains(tok) {
            flags.push(tok.to_string());
        } else {
            return Err(EngineError::format(format!("unknown option '{}'", tok)));
        }
    }
    Ok((flags, threshold))
}

fn points(args: &[&str]) -> Result<Vec<Point>> {
    if args.is_empty() {
        return Err(EngineError::format("expected at least one x,y point"));
    }
    args.iter().map(|t| parse_point(t)).collect()
}

/// Peel a trailing `secondary` / `primary` word off the argument list.
fn split_button<'a, 'b>(args: &'b [&'a str]) -> (Button, &'b [&'a str]) {
    match args.split_last() {
        Some((&"secondary", rest)) => (Button::Secondary, rest),
        Some((&"primary", rest)) => (Button::Primary, rest),
        _ => (Button::Primary, args),
    }
}

/// Lines starting with `#` are comments.  Mid-line, only a lone `#` word
/// starts a comment so `#RRGGBB` arguments survive.
fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'#' {
            continue;
        }
        let before_blank = i == 0 || bytes[i - 1].is_ascii_whitespace();
        let after_blank = bytes.get(i + 1).is_none_or(|c| c.is_ascii_whitespace());
        if before_blank && after_blank {
            return &line[..i];
        }
    }
    line
}

fn parse_bool(tok: &str) -> Result<bool> {
    match tok {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(EngineError::format(format!("expected true/false but found '{}'", tok))),
    }
}

impl Command {
    /// Parse one script line.  Blank lines and comments yield `None`.
    pub fn parse(line: &str) -> Result<Option<Command>> {
        let line = strip_comment(line).trim();
        if line.is_empty() {
            return Ok(None);
        }
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else { return Ok(None) };
        let args: Vec<&str> = words.collect();

        let cmd = match name.to_ascii_lowercase().as_str() {
            "color" => {
                let (button, rest) = match args.first() {
                    Some(&"secondary") => (Button::Secondary, &args[1..]),
                    Some(&"primary") => (Button::Primary, &args[1..]),
                    _ => (Button::Primary, &args[..]),
                };
                let color = Color::from_hex(arg(rest, 0, "color")?)?;
                Command::Color { button, color }
            }
            "size" => Command::Size(parse_num(arg(&args, 0, "size")?, "size")?),
            "shape" => Command::Shape(match arg(&args, 0, "shape")? {
                "circle" | "round" => BrushShape::Circle,
                "square" => BrushShape::Square,
                other => return Err(EngineError::format(format!("unknown shape '{}'", other))),
            }),
            "blend" => {
                let mode_name = arg(&args, 0, "blend mode")?;
                let mode = BlendMode::from_name(mode_name)
                    .ok_or_else(|| EngineError::format(format!("unknown blend mode '{}'", mode_name)))?;
                let opacity = args.get(1).map(|t| parse_num(t, "opacity")).transpose()?;
                Command::Blend { mode, opacity }
            }
            "pencil" | "squares" => {
                let (button, rest) = split_button(&args);
                let kind = if name.eq_ignore_ascii_case("pencil") { StrokeKind::Pencil } else { StrokeKind::Squares };
                Command::Stroke { kind, button, points: points(rest)? }
            }
            "dither" => {
                let (button, rest) = split_button(&args);
                let mut pattern = DitherPattern::Checkerboard;
                let mut pts = Vec::new();
                for tok in rest {
                    if let Some(level) = tok.strip_prefix("bayer=") {
                        pattern = DitherPattern::Bayer { level: parse_num(level, "bayer level")? };
                    } else {
                        pts.push(parse_point(tok)?);
                    }
                }
                if pts.is_empty() {
                    return Err(EngineError::format("expected at least one x,y point"));
                }
                Command::Stroke { kind: StrokeKind::Dither(pattern), button, points: pts }
            }
            "line" => {
                let (button, rest) = split_button(&args);
                Command::Line {
                    p1: parse_point(arg(rest, 0, "start point")?)?,
                    p2: parse_point(arg(rest, 1, "end point")?)?,
                    button,
                }
            }
            "fill" => {
                let (button, rest) = split_button(&args);
                let pos = parse_point(arg(rest, 0, "point")?)?;
                let (flags, threshold) = flags_and_threshold(&rest[1..], &["diagonal", "merge"])?;
                Command::Fill {
                    pos,
                    threshold: threshold.unwrap_or(0.0),
                    diagonal: flags.iter().any(|f| f == "diagonal"),
                    merge: flags.iter().any(|f| f == "merge"),
                    button,
                }
            }
            "magic" => {
                let pos = parse_point(arg(&args, 0, "point")?)?;
                let (flags, threshold) = flags_and_threshold(&args[1..], &["diagonal", "merge"])?;
                Command::Magic {
                    pos,
                    threshold: threshold.unwrap_or(0.0),
                    diagonal: flags.iter().any(|f| f == "diagonal"),
                    merge: flags.iter().any(|f| f == "merge"),
                }
            }
            "gradient" => {
                let kind = match args.get(2).copied() {
                    None | Some("linear") => GradientType::Linear,
                    Some("radial") => GradientType::Radial,
                    Some(other) => return Err(EngineError::format(format!("unknown gradient type '{}'", other))),
                };
                Command::Gradient {
                    p1: parse_point(arg(&args, 0, "start point")?)?,
                    p2: parse_point(arg(&args, 1, "end point")?)?,
                    kind,
                }
            }
            "replace" => {
                let pos = parse_point(arg(&args, 0, "point")?)?;
                let (flags, _) = flags_and_threshold(&args[1..], &["all-layers", "all-frames", "ignore-opacity"])?;
                let has = |f: &str| flags.iter().any(|x| x == f);
                Command::Replace {
                    pos,
                    all_layers: has("all-layers"),
                    all_frames: has("all-frames"),
                    ignore_opacity: has("ignore-opacity"),
                }
            }
            "sample" => {
                let (button, rest) = split_button(&args);
                let pos = parse_point(arg(rest, 0, "point")?)?;
                let (flags, _) = flags_and_threshold(&rest[1..], &["merge", "ignore-opacity"])?;
                Command::Sample {
                    pos,
                    ignore_opacity: flags.iter().any(|f| f == "ignore-opacity"),
                    merge: flags.iter().any(|f| f == "merge"),
                    button,
                }
            }
            "select-rect" => Command::SelectRect {
                p1: parse_point(arg(&args, 0, "first corner")?)?,
                p2: parse_point(arg(&args, 1, "second corner")?)?,
            },
            "select-all" => Command::SelectAll,
            "deselect" => Command::Deselect,
            "move" => {
                let (dx, dy) = parse_point(arg(&args, 0, "dx,dy")?)?;
                Command::Move { dx, dy }
            }
            "rotate" => {
                let degrees = parse_num(arg(&args, 0, "angle")?, "angle")?;
                let (flags, _) = flags_and_threshold(&args[1..], &["interpolate", "ignore-empty"])?;
                Command::Rotate {
                    degrees,
                    interpolate: flags.iter().any(|f| f == "interpolate"),
                    ignore_empty: flags.iter().any(|f| f == "ignore-empty"),
                }
            }
            "commit" => Command::Commit,
            "cancel" => Command::Cancel,
            "layer" => Command::Layer(parse_layer(&args)?),
            "frame" => Command::Frame(parse_frame(&args)?),
            "undo" => Command::Undo(args.first().map(|t| parse_num(t, "count")).transpose()?.unwrap_or(1)),
            "redo" => Command::Redo(args.first().map(|t| parse_num(t, "count")).transpose()?.unwrap_or(1)),
            "flip" => Command::Flip {
                horizontal: match arg(&args, 0, "direction")? {
                    "horizontal" | "h" => true,
                    "vertical" | "v" => false,
                    other => return Err(EngineError::format(format!("unknown flip direction '{}'", other))),
                },
            },
            "rotate-canvas" => Command::RotateCanvas(match arg(&args, 0, "rotation")? {
                "cw" | "90" => 90,
                "ccw" | "-90" | "270" => -90,
                "180" => 180,
                other => return Err(EngineError::format(format!("unknown rotation '{}'", other))),
            }),
            "resize" => {
                let which = arg(&args, 0, "image|canvas")?;
                let width = parse_num(arg(&args, 1, "width")?, "width")?;
                let height = parse_num(arg(&args, 2, "height")?, "height")?;
                match which {
                    "image" => {
                        let interp = match args.get(3) {
                            Some(name) => Interpolation::from_name(name)
                                .ok_or_else(|| EngineError::format(format!("unknown interpolation '{}'", name)))?,
                            None => Interpolation::default(),
                        };
                        Command::ResizeImage { width, height, interp }
                    }
                    "canvas" => {
                        let anchor = match args.get(3) {
                            Some(name) => Anchor::from_name(name)
                                .ok_or_else(|| EngineError::format(format!("unknown anchor '{}'", name)))?,
                            None => Anchor::default(),
                        };
                        Command::ResizeCanvas { width, height, anchor }
                    }
                    other => return Err(EngineError::format(format!("resize expects image or canvas, got '{}'", other))),
                }
            }
            other => return Err(EngineError::format(format!("unknown command '{}'", other))),
        };
        Ok(Some(cmd))
    }

    /// Apply the command to `project`.
    pub fn execute(&self, project: &mut Project) -> Result<()> {
        match self {
            Command::Color { button, color } => match button {
                Button::Primary => project.primary_color = *color,
                Button::Secondary => project.secondary_color = *color,
            },
            Command::Size(size) => project.tools.size = (*size).clamp(1, 1000),
            Command::Shape(shape) => project.tools.shape = *shape,
            Command::Blend { mode, opacity } => {
                project.tools.blend_mode = *mode;
                if let Some(o) = opacity {
                    project.tools.opacity = o.clamp(0.0, 1.0);
                }
            }
            Command::Stroke { kind, button, points } => {
                let Some((&first, rest)) = points.split_first() else { return Ok(()) };
                project.begin_stroke(*kind, *button, first)?;
                for &p in rest {
                    project.stroke(p)?;
                }
                project.end_stroke()?;
            }
            Command::Line { p1, p2, button } => {
                project.draw_line(*p1, *p2, *button)?;
            }
            Command::Fill { pos, threshold, diagonal, merge, button } => {
                project.fill(*pos, *button, *threshold, *diagonal, *merge)?;
            }
            Command::Gradient { p1, p2, kind } => {
                project.gradient(*p1, *p2, *kind)?;
            }
            Command::Replace { pos, all_layers, all_frames, ignore_opacity } => {
                project.replace_color(*pos, *all_layers, *all_frames, *ignore_opacity)?;
            }
            Command::Sample { pos, ignore_opacity, merge, button } => {
                project.sample_color(*pos, *ignore_opacity, *merge, *button);
            }
            Command::SelectRect { p1, p2 } => {
                project.select_rect(*p1, *p2)?;
            }
            Command::SelectAll => {
                project.select_all()?;
            }
            Command::Deselect => {
                project.deselect()?;
            }
            Command::Magic { pos, threshold, diagonal, merge } => {
                project.magic_select(*pos, *threshold, *diagonal, *merge)?;
            }
            Command::Move { dx, dy } => {
                ensure_taken(project)?;
                project.move_selection(*dx, *dy)?;
            }
            Command::Rotate { degrees, interpolate, ignore_empty } => {
                ensure_taken(project)?;
                project.rotate_selection(*degrees, *interpolate, *ignore_empty)?;
            }
            Command::Commit => {
                project.commit_selection()?;
            }
            Command::Cancel => project.cancel(),
            Command::Layer(cmd) => execute_layer(project, cmd)?,
            Command::Frame(cmd) => match cmd {
                FrameCommand::Add => project.add_frame()?,
                FrameCommand::Duplicate => project.duplicate_frame()?,
                FrameCommand::Delete(i) => {
                    let index = i.unwrap_or_else(|| project.read(|c| c.current_frame));
                    project.delete_frame(index)?
                }
                FrameCommand::Select(i) => project.set_current_frame(*i)?,
            },
            Command::Undo(n) => {
                for _ in 0..*n {
                    project.undo()?;
                }
            }
            Command::Redo(n) => {
                for _ in 0..*n {
                    project.redo()?;
                }
            }
            Command::Flip { horizontal } => {
                if *horizontal {
                    project.flip_horizontal()?
                } else {
                    project.flip_vertical()?
                }
            }
            Command::RotateCanvas(deg) => match deg {
                90 => project.rotate_90cw()?,
                -90 => project.rotate_90ccw()?,
                _ => project.rotate_180()?,
            },
            Command::ResizeImage { width, height, interp } => project.resize_image(*width, *height, *interp)?,
            Command::ResizeCanvas { width, height, anchor } => project.resize_canvas(*width, *height, *anchor)?,
        }
        Ok(())
    }
}

/// Script `move` / `rotate` lift the selection on first use.
fn ensure_taken(project: &mut Project) -> Result<()> {
    if !project.read(|c| c.selection.is_transforming()) {
        project.take_selection()?;
    }
    Ok(())
}

fn parse_layer(args: &[&str]) -> Result<LayerCommand> {
    let index = |i: usize| -> Result<usize> { parse_num(arg(args, i, "layer index")?, "layer index") };
    let optional = |i: usize| -> Result<Option<usize>> {
        args.get(i).map(|t| parse_num(t, "layer index")).transpose()
    };
    Ok(match arg(args, 0, "layer sub-command")? {
        "add" => LayerCommand::Add,
        "delete" => LayerCommand::Delete(optional(1)?),
        "duplicate" => LayerCommand::Duplicate(optional(1)?),
        "move" => LayerCommand::Move { from: index(1)?, to: index(2)? },
        "select" => LayerCommand::Select(index(1)?),
        "opacity" => LayerCommand::Opacity(index(1)?, parse_num(arg(args, 2, "opacity")?, "opacity")?),
        "visible" => LayerCommand::Visible(index(1)?, parse_bool(arg(args, 2, "true/false")?)?),
        "blend" => {
            let name = arg(args, 2, "blend mode")?;
            let mode = BlendMode::from_name(name)
                .ok_or_else(|| EngineError::format(format!("unknown blend mode '{}'", name)))?;
            LayerCommand::Blend(index(1)?, mode)
        }
        "rename" => {
            let name = args.get(2..).map(|w| w.join(" ")).unwrap_or_default();
            if name.is_empty() {
                return Err(EngineError::format("missing layer name"));
            }
            LayerCommand::Rename(index(1)?, name)
        }
        other => return Err(EngineError::format(format!("unknown layer sub-command '{}'", other))),
    })
}

fn parse_frame(args: &[&str]) -> Result<FrameCommand> {
    Ok(match arg(args, 0, "frame sub-command")? {
        "add" => FrameCommand::Add,
        "duplicate" => FrameCommand::Duplicate,
        "delete" => FrameCommand::Delete(args.get(1).map(|t| parse_num(t, "frame index")).transpose()?),
        "select" => FrameCommand::Select(parse_num(arg(args, 1, "frame index")?, "frame index")?),
        other => return Err(EngineError::format(format!("unknown frame sub-command '{}'", other))),
    })
}

fn execute_layer(project: &mut Project, cmd: &LayerCommand) -> Result<()> {
    let active = project.read(|c| c.active_layer_index);
    match cmd {
        LayerCommand::Add => project.add_layer(),
        LayerCommand::Delete(i) => project.delete_layer(i.unwrap_or(active)),
        LayerCommand::Duplicate(i) => project.duplicate_layer(i.unwrap_or(active)),
        LayerCommand::Move { from, to } => project.move_layer(*from, *to),
        LayerCommand::Select(i) => project.select_layer(*i),
        LayerCommand::Opacity(i, v) => project.set_layer_opacity(*i, *v),
        LayerCommand::Visible(i, v) => project.set_layer_visibility(*i, *v),
        LayerCommand::Blend(i, mode) => project.set_layer_blend_mode(*i, *mode),
        LayerCommand::Rename(i, name) => project.rename_layer(*i, name),
    }
}

// ============================================================================
// Script runner
// ============================================================================

#[derive(Debug, Default)]
pub struct ScriptReport {
    pub executed: usize,
    /// Rejected commands that were skipped, prefixed with their line number.
    pub warnings: Vec<String>,
}

/// Parse the whole script up front, then execute it.  A malformed line
/// fails the run before anything is drawn.  Commands the engine rejects
/// (`InvalidOperation`) are skipped and reported unless `strict`.
pub fn run_script(project: &mut Project, source: &str, strict: bool, verbose: bool) -> Result<ScriptReport> {
    let mut commands = Vec::new();
    for (i, line) in source.lines().enumerate() {
        match Command::parse(line) {
            Ok(Some(cmd)) => commands.push((i + 1, cmd)),
            Ok(None) => {}
            Err(e) => {
                let msg = format!("line {}: {}", i + 1, e);
                log_warn!("Script rejected: {}", msg);
                return Err(EngineError::format(msg));
            }
        }
    }

    let mut report = ScriptReport::default();
    for (line_no, cmd) in commands {
        if verbose {
            println!("  [{}] {:?}", line_no, cmd);
        }
        match cmd.execute(project) {
            Ok(()) => report.executed += 1,
            Err(e) if e.is_recoverable() && !strict => {
                report.warnings.push(format!("line {}: {}", line_no, e));
            }
            Err(e) => return Err(EngineError::invalid(format!("line {}: {}", line_no, e))),
        }
    }
    log_info!("Script finished: {} executed, {} skipped", report.executed, report.warnings.len());
    Ok(report)
}

/// Run a script file against `project`.
pub fn run_script_file(project: &mut Project, path: &Path, strict: bool) -> Result<ScriptReport> {
    let source = std::fs::read_to_string(path)?;
    run_script(project, &source, strict, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(w: u32, h: u32) -> Project {
        Project::new_untitled(1, w, h, EngineSettings::default())
    }

    #[test]
    fn parses_points_flags_and_comments() {
        assert_eq!(Command::parse("   # nothing here").unwrap(), None);
        assert_eq!(
            Command::parse("fill 2,3 0.25 diagonal # flood").unwrap(),
            Some(Command::Fill { pos: (2, 3), threshold: 0.25, diagonal: true, merge: false, button: Button::Primary })
        );
        assert_eq!(
            Command::parse("color secondary #00FF00").unwrap(),
            Some(Command::Color { button: Button::Secondary, color: Color::GREEN })
        );
        assert_eq!(
            Command::parse("resize canvas 10 12 center").unwrap(),
            Some(Command::ResizeCanvas { width: 10, height: 12, anchor: Anchor::Center })
        );
        assert_eq!(
            Command::parse("dither 1,1 4,4 bayer=8").unwrap(),
            Some(Command::Stroke {
                kind: StrokeKind::Dither(DitherPattern::Bayer { level: 8 }),
                button: Button::Primary,
                points: vec![(1, 1), (4, 4)],
            })
        );
    }

    #[test]
    fn malformed_lines_are_format_errors() {
        for bad in ["pencil 1;2", "color #GG0000", "warp 1,1", "fill", "layer spin", "flip sideways"] {
            assert!(matches!(Command::parse(bad), Err(EngineError::Format(_))), "{}", bad);
        }
    }

    #[test]
    fn script_reports_line_numbers() {
        let mut p = blank(4, 4);
        let err = run_script(&mut p, "size 2\n\npencil 1,1\nbogus\n", false, false).unwrap_err();
        assert!(err.to_string().contains("line 4"), "{}", err);
        // Nothing ran because parsing failed first.
        assert!(p.history.is_empty());
    }

    #[test]
    fn rejected_commands_are_skipped_unless_strict() {
        let mut p = blank(4, 4);
        let report = run_script(&mut p, "commit\npencil 0,0\nundo\nundo\n", false, false).unwrap();
        assert_eq!(report.executed, 2);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[0].starts_with("line 1"));

        let mut p = blank(4, 4);
        assert!(run_script(&mut p, "commit\n", true, false).is_err());
    }

    #[test]
    fn drawing_script_end_to_end() {
        let mut p = blank(8, 8);
        let script = "\
            color #FF0000\n\
            squares 0,0 7,0\n\
            layer add\n\
            color #0000FF\n\
            fill 0,0\n\
            select-rect 0,0 1,1\n\
            move 2,2\n\
            commit\n\
            layer opacity 1 0.5\n\
            undo\n";
        let report = run_script(&mut p, script, true, false).unwrap();
        assert_eq!(report.executed, 10);
        p.read(|c| {
            assert_eq!(c.layer_count(), 2);
            assert_eq!(c.frames[0].layers[0].pixels.get_pixel(5, 0), Color::RED);
            assert_eq!(c.frames[0].layers[1].pixels.get_pixel(3, 3), Color::BLUE);
            assert_eq!(c.frames[0].layers[1].pixels.get_pixel(0, 0), Color::TRANSPARENT);
            assert_eq!(c.frames[0].layers[1].opacity, 1.0);
        });
    }
}
