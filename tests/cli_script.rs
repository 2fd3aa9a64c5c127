//! Headless script runs, end to end through the file formats.

use paintcore::cli::{self, Command};
use paintcore::io;
use paintcore::project::Project;
use paintcore::settings::EngineSettings;
use paintcore::Color;

const SCRIPT: &str = "\
# two layers, two frames
color #FF0000
shape square
size 2
pencil 0,0 3,0
layer add
layer rename 1 Ink Layer
color secondary #0000FF80
fill 5,5 secondary
layer blend 1 multiply
frame duplicate
frame select 0
";

#[test]
fn script_output_survives_project_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("ops.txt");
    std::fs::write(&script_path, SCRIPT).unwrap();

    let mut p = Project::new_untitled(1, 8, 8, EngineSettings::default());
    let report = cli::run_script_file(&mut p, &script_path, true).unwrap();
    assert!(report.warnings.is_empty());

    let pcp = dir.path().join("out.pcp");
    p.save(Some(&pcp)).unwrap();
    let loaded = io::load_project(&pcp).unwrap();
    assert_eq!(loaded.frame_count(), 2);
    assert_eq!(loaded.layer_count(), 2);
    assert_eq!(loaded.current_frame, 0);
    let ink = &loaded.frames[1].layers[1];
    assert_eq!(ink.name, "Ink Layer");
    assert_eq!(ink.pixels.get_pixel(7, 7).to_rgba8(), [0, 0, 255, 128]);
    assert_eq!(loaded.frames[0].layers[0].pixels.get_pixel(3, 1), Color::RED);

    let reopened = Project::open(&pcp, EngineSettings::default()).unwrap();
    assert_eq!(reopened.path.as_deref(), Some(pcp.as_path()));
}

#[test]
fn exported_png_can_be_reopened_as_an_image() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = Project::new_untitled(1, 4, 4, EngineSettings::default());
    cli::run_script(&mut p, "color #00FF00\nfill 0,0\nrotate-canvas 180\n", true, false).unwrap();

    let png = dir.path().join("flat.png");
    p.export_image(&png, 90).unwrap();
    let img = Project::open(&png, EngineSettings::default()).unwrap();
    assert!(img.path.is_none());
    img.read(|c| {
        assert_eq!((c.width, c.height), (4, 4));
        assert_eq!(c.frames[0].layers[0].name, "flat");
        assert_eq!(c.get_pixel(2, 3), Color::GREEN);
    });
}

#[test]
fn every_documented_command_parses() {
    let lines = [
        "color primary #123456",
        "size 3",
        "shape circle",
        "blend screen 0.5",
        "pencil 1,1",
        "line 0,0 3,3 secondary",
        "squares 0,0 2,2",
        "fill 1,1 0.1 diagonal merge",
        "gradient 0,0 3,3 radial",
        "dither 1,1 bayer=4",
        "replace 1,1 all-layers all-frames ignore-opacity",
        "sample 0,0 merge",
        "select-rect 0,0 2,2",
        "select-all",
        "deselect",
        "magic 1,1 0.2",
        "move 1,-1",
        "rotate 45 interpolate ignore-empty",
        "commit",
        "cancel",
        "layer opacity 0 0.25",
        "layer visible 0 false",
        "layer move 0 1",
        "frame add",
        "undo 2",
        "redo",
        "flip vertical",
        "rotate-canvas ccw",
        "resize image 8 8 lanczos3",
        "resize canvas 16 16 bottom-right",
    ];
    for line in lines {
        assert!(matches!(Command::parse(line), Ok(Some(_))), "{}", line);
    }
}

#[test]
fn far_off_canvas_line_commands_finish_quickly() {
    let mut p = Project::new_untitled(1, 8, 8, EngineSettings::default());
    let report = cli::run_script(&mut p, "line -2000000000,-9 2000000000,-9\n", true, false).unwrap();
    assert_eq!(report.executed, 1);
    assert!(p.history.is_empty());
    p.read(|c| assert!(c.frames[0].layers[0].pixels.is_empty()));

    cli::run_script(&mut p, "line -2000000000,0 2000000000,0\n", true, false).unwrap();
    assert_eq!(p.history.len(), 1);
    p.read(|c| {
        assert!((0..8).all(|x| c.get_pixel(x, 0) == Color::BLACK));
        assert_eq!(c.get_pixel(0, 1), Color::TRANSPARENT);
    });
}
