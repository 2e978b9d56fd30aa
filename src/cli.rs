//! Command-line argument handling: the `clap` builder and the translation
//! from parsed flags into a [`crate::config::DriverOptions`].

use std::path::PathBuf;
use std::time::Duration;

use clap::{App, Arg, ArgMatches};

use crate::config::{DriverOptions, DriverOptionsBuilder};
use crate::error::DriverError;

pub fn build_cli() -> App<'static, 'static> {
    App::new("sertop-driver")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Drives a sertop subprocess over a Coq source file, sentence by sentence")
        .arg(
            Arg::with_name("srcfile")
                .help("Coq source file to drive")
                .index(1)
                .required_unless("interactive"),
        )
        .arg(
            Arg::with_name("sertop")
                .long("sertop")
                .takes_value(true)
                .help("override the sertop command line (default: `sertop --implicit --omit_loc`)"),
        )
        .arg(
            Arg::with_name("project-path")
                .long("project-path")
                .takes_value(true)
                .help("working directory for the subprocess and the _CoqProject search root"),
        )
        .arg(
            Arg::with_name("includes")
                .long("includes")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("extra PHYSICAL=LOGICAL load path, beyond what _CoqProject supplies"),
        )
        .arg(Arg::with_name("prelude").long("prelude").takes_value(true).help("a .v file to load before srcfile"))
        .arg(Arg::with_name("hammer").long("hammer").help("preload the hammer plugin and tune its time limits"))
        .arg(
            Arg::with_name("timeout")
                .long("timeout")
                .takes_value(true)
                .help("per-message timeout in seconds (default 30)"),
        )
        .arg(
            Arg::with_name("interactive")
                .short("i")
                .long("interactive")
                .help("read sentences from stdin instead of srcfile"),
        )
        .arg(Arg::with_name("progress").long("progress").help("print each accepted sentence's state id to stderr"))
        .arg(Arg::with_name("verbose").short("v").long("verbose").multiple(true).help("increase diagnostic verbosity"))
}

/// Parse an `--includes PHYS=LOGICAL` value into an `Add LoadPath` sentence.
fn include_to_vernacular(spec: &str) -> Option<String> {
    let (phys, logical) = spec.split_once('=')?;
    Some(format!("Add LoadPath \"{}\" as {}.", phys, logical))
}

pub fn options_from_matches(matches: &ArgMatches) -> Result<DriverOptions, DriverError> {
    let mut builder = DriverOptionsBuilder::new();

    if let Some(sertop) = matches.value_of("sertop") {
        builder = builder.coq_command(sertop.split_whitespace().map(str::to_string));
    }
    if let Some(project_path) = matches.value_of("project-path") {
        builder = builder.project_path(project_path);
    } else if let Some(srcfile) = matches.value_of("srcfile") {
        if let Some(parent) = PathBuf::from(srcfile).parent() {
            builder = builder.project_path(parent);
        }
    }
    if let Some(srcfile) = matches.value_of("srcfile") {
        builder = builder.module_path(srcfile);
    }
    if let Some(secs) = matches.value_of("timeout") {
        let secs: u64 = secs.parse().map_err(|_| DriverError::InvalidConfig {
            message: format!("--timeout value `{}` is not a whole number of seconds", secs),
        })?;
        builder = builder.timeout(Duration::from_secs(secs));
    }
    builder = builder.use_hammer(matches.is_present("hammer"));
    builder = builder.verbose(matches.occurrences_of("verbose").min(u8::MAX as u64) as u8);

    builder.build()
}

/// The `Add LoadPath` sentences from `--includes`, beyond what `_CoqProject`
/// discovery already supplies.
pub fn extra_includes(matches: &ArgMatches) -> Vec<String> {
    matches.values_of("includes").into_iter().flatten().filter_map(include_to_vernacular).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_srcfile_and_timeout() {
        let matches = build_cli().get_matches_from(vec!["sertop-driver", "--timeout", "10", "Foo.v"]);
        let opts = options_from_matches(&matches).unwrap();
        assert_eq!(opts.timeout, Duration::from_secs(10));
        assert_eq!(opts.module_path, PathBuf::from("Foo.v"));
    }

    #[test]
    fn include_spec_becomes_load_path_sentence() {
        assert_eq!(include_to_vernacular("src=MyLib"), Some("Add LoadPath \"src\" as MyLib.".to_string()));
        assert_eq!(include_to_vernacular("garbage"), None);
    }

    #[test]
    fn interactive_mode_does_not_require_srcfile() {
        let matches = build_cli().get_matches_from(vec!["sertop-driver", "--interactive"]);
        assert!(matches.is_present("interactive"));
    }
}
