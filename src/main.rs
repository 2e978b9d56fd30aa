//! CLI entry point: parse arguments, spawn a [`sertop_driver::driver::Driver`],
//! and drive it over a source file (or, in `--interactive` mode, over stdin)
//! one sentence at a time.

mod cli;

use std::fs;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use log::LevelFilter;

use sertop_driver::driver::Driver;
use sertop_driver::preprocess;

/// Split a whole source file into top-level sentences: text up to and
/// including each `.` that is followed by whitespace or end-of-input, not
/// nested inside parens/brackets or a string literal. Comments are stripped
/// first, so a `.` inside a `(* ... *)` block never counts.
fn split_top_level_sentences(source: &str) -> Vec<String> {
    let cleaned = preprocess::kill_comments(source);
    let bytes = cleaned.as_bytes();
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut escape = false;
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];
        if escape {
            escape = false;
            i += 1;
            continue;
        }
        match b {
            b'\\' if in_quote => escape = true,
            b'"' => in_quote = !in_quote,
            b'(' | b'[' if !in_quote => depth += 1,
            b')' | b']' if !in_quote => depth -= 1,
            b'.' if !in_quote && depth == 0 => {
                let next_is_boundary = i + 1 >= bytes.len() || bytes[i + 1].is_ascii_whitespace();
                if next_is_boundary {
                    let sentence = cleaned[start..=i].trim();
                    if !sentence.is_empty() {
                        out.push(sentence.to_string());
                    }
                    start = i + 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    let tail = cleaned[start..].trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

/// Render a failed sentence and its error message as an annotated snippet,
/// in the style of a compiler diagnostic.
fn print_diagnostic(sentence: &str, message: &str) {
    use annotate_snippets::display_list::{DisplayList, FormatOptions};
    use annotate_snippets::snippet::{Annotation, AnnotationType, Slice, Snippet, SourceAnnotation};

    let trimmed = sentence.trim();
    let snippet = Snippet {
        title: Some(Annotation { label: Some(message), id: None, annotation_type: AnnotationType::Error }),
        footer: vec![],
        slices: vec![Slice {
            source: trimmed,
            line_start: 1,
            origin: None,
            fold: false,
            annotations: vec![SourceAnnotation { range: (0, trimmed.len()), label: "", annotation_type: AnnotationType::Error }],
        }],
        opt: FormatOptions { color: true, ..Default::default() },
    };
    eprintln!("{}", DisplayList::from(snippet));
}

fn run_sentence(driver: &mut Driver, sentence: &str, progress: bool) -> bool {
    match driver.run_stmt(sentence) {
        Ok(outcomes) => {
            if progress {
                for outcome in &outcomes {
                    eprintln!("-> state {}", outcome.state_id);
                }
            }
            true
        }
        Err(e) => {
            print_diagnostic(sentence, &e.to_string());
            false
        }
    }
}

fn run_interactive(driver: &mut Driver, progress: bool) -> bool {
    let stdin = io::stdin();
    let mut ok = true;
    print!("> ");
    let _ = io::stdout().flush();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        for sentence in split_top_level_sentences(&line) {
            ok &= run_sentence(driver, &sentence, progress);
        }
        print!("> ");
        let _ = io::stdout().flush();
    }
    ok
}

fn main() -> ExitCode {
    let matches = cli::build_cli().get_matches();

    let verbosity = matches.occurrences_of("verbose");
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    simple_logger::SimpleLogger::new().with_level(level).init().expect("logger can only be initialized once");

    let options = match cli::options_from_matches(&matches) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut driver = match Driver::new(options) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("failed to start sertop: {}", e);
            return ExitCode::FAILURE;
        }
    };

    for sentence in cli::extra_includes(&matches) {
        if !run_sentence(&mut driver, &sentence, false) {
            return ExitCode::FAILURE;
        }
    }
    if let Some(prelude) = matches.value_of("prelude") {
        let source = match fs::read_to_string(prelude) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("failed to read prelude {}: {}", prelude, e);
                return ExitCode::FAILURE;
            }
        };
        for sentence in split_top_level_sentences(&source) {
            if !run_sentence(&mut driver, &sentence, matches.is_present("progress")) {
                return ExitCode::FAILURE;
            }
        }
    }

    let progress = matches.is_present("progress");
    let ok = if matches.is_present("interactive") {
        run_interactive(&mut driver, progress)
    } else {
        let srcfile = matches.value_of("srcfile").expect("required unless --interactive");
        let source = match fs::read_to_string(srcfile) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("failed to read {}: {}", srcfile, e);
                return ExitCode::FAILURE;
            }
        };
        let mut ok = true;
        for sentence in split_top_level_sentences(&source) {
            if !run_sentence(&mut driver, &sentence, progress) {
                ok = false;
                break;
            }
        }
        ok
    };

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_top_level_sentences_on_periods() {
        let sentences = split_top_level_sentences("Lemma l : True.\nProof. exact I. Qed.");
        assert_eq!(sentences, vec!["Lemma l : True.", "Proof.", "exact I.", "Qed."]);
    }

    #[test]
    fn does_not_split_on_periods_inside_strings_or_parens() {
        let sentences = split_top_level_sentences(r#"Check (1, "a.b")."#);
        assert_eq!(sentences, vec![r#"Check (1, "a.b")."#.to_string()]);
    }

    #[test]
    fn comments_are_stripped_before_splitting() {
        let sentences = split_top_level_sentences("Qed. (* done. *)");
        assert_eq!(sentences, vec!["Qed."]);
    }
}
