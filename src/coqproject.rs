//! `_CoqProject` discovery: walk upward from the source module's directory
//! to the project root, inclusive, collecting every `_CoqProject` found
//! along the way, parse their `-R`/`-Q`/`-I` flags, and turn them into the
//! `Add LoadPath`/`Add ML Path` vernacular sentences the init sequence feeds
//! the prover before anything else.

use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::error::DriverError;

/// Walk every ancestor directory from `module_path` up to and including
/// `project_path`, collecting the `_CoqProject` file at each one that has
/// one. A nested project can legitimately have `_CoqProject` files at more
/// than one level; every one found is returned, nearest to `module_path`
/// first. The walk never climbs past `project_path` — if `module_path` is
/// not actually nested under it, `project_path` itself is the only
/// directory consulted.
fn find_all_coqprojects(module_path: &Path, project_path: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let start = if module_path.starts_with(project_path) { module_path } else { project_path };
    for dir in start.ancestors() {
        let candidate = dir.join("_CoqProject");
        if candidate.is_file() {
            found.push(candidate);
        }
        if dir == project_path {
            break;
        }
    }
    found
}

/// One `-R`/`-Q`/`-I` entry from a `_CoqProject` file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProjectFlag {
    /// `-R physical logical`: recursive, with namespacing.
    Recursive { physical: String, logical: String },
    /// `-Q physical logical`: non-recursive, with namespacing.
    NonRecursive { physical: String, logical: String },
    /// `-I physical`: an ML include path, no Coq namespacing.
    MlInclude { physical: String },
}

/// Tokenize a `_CoqProject` file's contents, skipping comments (`#` to end
/// of line) and respecting simple double-quoting around paths with spaces.
fn tokenize(contents: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for raw_line in contents.lines() {
        let line = match raw_line.find('#') {
            Some(idx) => &raw_line[..idx],
            None => raw_line,
        };
        let mut cur = String::new();
        let mut in_quote = false;
        for c in line.chars() {
            match c {
                '"' => in_quote = !in_quote,
                c if c.is_whitespace() && !in_quote => {
                    if !cur.is_empty() {
                        tokens.push(std::mem::take(&mut cur));
                    }
                }
                c => cur.push(c),
            }
        }
        if !cur.is_empty() {
            tokens.push(cur);
        }
    }
    tokens
}

fn parse_flags(tokens: &[String]) -> Vec<ProjectFlag> {
    let mut flags = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i].as_str() {
            "-R" if i + 2 < tokens.len() => {
                flags.push(ProjectFlag::Recursive { physical: tokens[i + 1].clone(), logical: tokens[i + 2].clone() });
                i += 3;
            }
            "-Q" if i + 2 < tokens.len() => {
                flags.push(ProjectFlag::NonRecursive {
                    physical: tokens[i + 1].clone(),
                    logical: tokens[i + 2].clone(),
                });
                i += 3;
            }
            "-I" if i + 1 < tokens.len() => {
                flags.push(ProjectFlag::MlInclude { physical: tokens[i + 1].clone() });
                i += 2;
            }
            _ => i += 1,
        }
    }
    flags
}

fn flags_to_vernaculars(flags: &[ProjectFlag]) -> Vec<String> {
    flags
        .iter()
        .map(|flag| match flag {
            ProjectFlag::Recursive { physical, logical } => {
                format!("Add Rec LoadPath \"{}\" as {}.", physical, logical)
            }
            ProjectFlag::NonRecursive { physical, logical } => {
                format!("Add LoadPath \"{}\" as {}.", physical, logical)
            }
            ProjectFlag::MlInclude { physical } => format!("Add ML Path \"{}\".", physical),
        })
        .unique()
        .collect()
}

/// Discover and parse every `_CoqProject` between `module_path` and
/// `project_path` (inclusive), returning the deduped `Add LoadPath`/
/// `Add ML Path`/`Add Rec LoadPath` sentences to run at session init. No
/// `_CoqProject` anywhere in that range is not an error: the session simply
/// gets no extra load paths.
pub fn discover_vernaculars(module_path: &Path, project_path: &Path) -> Result<Vec<String>, DriverError> {
    let mut flags = Vec::new();
    for path in find_all_coqprojects(module_path, project_path) {
        let contents = fs::read_to_string(&path)?;
        let tokens = tokenize(&contents);
        flags.extend(parse_flags(&tokens));
    }
    Ok(flags_to_vernaculars(&flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_skips_comments_and_respects_quotes() {
        let tokens = tokenize("-R \"my lib\" MyLib\n# a comment\n-I bin\n");
        assert_eq!(tokens, vec!["-R", "my lib", "MyLib", "-I", "bin"]);
    }

    #[test]
    fn parses_recursive_and_include_flags() {
        let tokens = tokenize("-R src Foo -Q test Foo.Test -I plugin");
        let flags = parse_flags(&tokens);
        assert_eq!(
            flags,
            vec![
                ProjectFlag::Recursive { physical: "src".into(), logical: "Foo".into() },
                ProjectFlag::NonRecursive { physical: "test".into(), logical: "Foo.Test".into() },
                ProjectFlag::MlInclude { physical: "plugin".into() },
            ]
        );
    }

    #[test]
    fn flags_become_deduped_vernaculars() {
        let flags = vec![
            ProjectFlag::Recursive { physical: "src".into(), logical: "Foo".into() },
            ProjectFlag::Recursive { physical: "src".into(), logical: "Foo".into() },
        ];
        let sentences = flags_to_vernaculars(&flags);
        assert_eq!(sentences, vec!["Add Rec LoadPath \"src\" as Foo.".to_string()]);
    }

    #[test]
    fn missing_coqproject_yields_no_sentences() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("a/b/Foo.v");
        assert!(discover_vernaculars(&module, dir.path()).unwrap().is_empty());
    }

    #[test]
    fn discovers_coqproject_from_a_nested_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("_CoqProject"), "-R src Foo\n").unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        let module = nested.join("Foo.v");
        let sentences = discover_vernaculars(&module, dir.path()).unwrap();
        assert_eq!(sentences, vec!["Add Rec LoadPath \"src\" as Foo.".to_string()]);
    }

    #[test]
    fn accumulates_coqprojects_from_every_nested_level() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("_CoqProject"), "-R src Outer\n").unwrap();
        let nested = dir.path().join("a");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("_CoqProject"), "-R src Inner\n").unwrap();
        let module = nested.join("Foo.v");
        let sentences = discover_vernaculars(&module, dir.path()).unwrap();
        assert_eq!(
            sentences,
            vec!["Add Rec LoadPath \"src\" as Inner.".to_string(), "Add Rec LoadPath \"src\" as Outer.".to_string()]
        );
    }

    #[test]
    fn does_not_climb_past_project_path() {
        let dir = tempfile::tempdir().unwrap();
        let outer_parent = dir.path();
        let project = outer_parent.join("proj");
        fs::create_dir_all(&project).unwrap();
        // A _CoqProject above project_path must never be picked up.
        fs::write(outer_parent.join("_CoqProject"), "-R src Rogue\n").unwrap();
        let module = project.join("Foo.v");
        assert!(discover_vernaculars(&module, &project).unwrap().is_empty());
    }
}
