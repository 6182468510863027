//! Command line handling shared by the mamirc daemons. Each binary takes exactly one positional
//! argument: the path of its JSON configuration file.

use std::path::PathBuf;
use std::process::exit;

/// Returns the configuration file path, handling `--help` and `--version` along the way. Exits
/// with code 1 when the arguments are unusable.
pub fn parse_config_path(program: &str, version: &str, description: &str) -> PathBuf {
    let mut config_path: Option<PathBuf> = None;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{program} {version}");
                println!("{description}");
                println!();
                println!("Usage: {program} <config.json>");
                println!();
                println!("The only argument is the path of the JSON configuration file.");
                println!("  -h, --help       print this text");
                println!("  -V, --version    print the version");
                exit(0);
            }
            "-V" | "--version" => {
                println!("{program} {version}");
                exit(0);
            }
            flag if flag.starts_with('-') => {
                eprintln!("{program}: unrecognized option '{flag}' (see --help)");
                exit(1);
            }
            _ if config_path.is_some() => {
                eprintln!("{program}: expected a single configuration file, got more than one");
                exit(1);
            }
            path => config_path = Some(PathBuf::from(path)),
        }
    }

    match config_path {
        Some(config_path) => config_path,
        None => {
            eprintln!("{program}: a JSON configuration file is required (see --help)");
            exit(1);
        }
    }
}
