//! Static analysis of shell commands and file writes for operations that are
//! never allowed: recursive deletes outside scratch space, writes to
//! credential files, and anything matching a configured deny pattern.

use crate::config::GuardConfig;

/// Split a command line into simple commands on `;`, `&&`, `||`, `|` and
/// newlines, then into words. Quotes group words and are removed; a
/// backslash escapes the next character outside single quotes.
pub fn split_commands(line: &str) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    word.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(n) = chars.next() {
                                word.push(n);
                            }
                        }
                        _ => word.push(q),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(n) = chars.next() {
                    word.push(n);
                }
            }
            ';' | '\n' | '&' | '|' => {
                end_word(&mut word, &mut in_word, &mut words);
                // `&&`, `||` and `|&` collapse into one separator.
                if matches!(chars.peek(), Some('&') | Some('|')) {
                    chars.next();
                }
                if !words.is_empty() {
                    commands.push(std::mem::take(&mut words));
                }
            }
            '>' => {
                end_word(&mut word, &mut in_word, &mut words);
                let mut op = String::from(">");
                if chars.peek() == Some(&'>') {
                    chars.next();
                    op.push('>');
                }
                words.push(op);
            }
            c if c.is_whitespace() => end_word(&mut word, &mut in_word, &mut words),
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    end_word(&mut word, &mut in_word, &mut words);
    if !words.is_empty() {
        commands.push(words);
    }
    commands
}

fn end_word(word: &mut String, in_word: &mut bool, words: &mut Vec<String>) {
    if *in_word {
        words.push(std::mem::take(word));
        *in_word = false;
    }
}

/// Strip wrappers (`sudo`, `env`, `command`, `VAR=value`) and any directory
/// from the program name, returning the program and its arguments.
fn program(words: &[String]) -> Option<(&str, &[String])> {
    let mut i = 0;
    while i < words.len() {
        let w = words[i].as_str();
        let wrapper = matches!(w, "sudo" | "env" | "command" | "exec" | "nohup" | "time");
        let assignment = !w.starts_with('-') && w.contains('=') && !w.starts_with('=');
        if wrapper || assignment {
            i += 1;
            continue;
        }
        let name = w.rsplit('/').next().unwrap_or(w);
        return Some((name, &words[i + 1..]));
    }
    None
}

fn is_recursive_flag(arg: &str) -> bool {
    if arg == "--recursive" {
        return true;
    }
    arg.starts_with('-')
        && !arg.starts_with("--")
        && arg[1..].chars().any(|c| c == 'r' || c == 'R')
}

/// Targets of a recursive `rm`, or `None` when the words are not one.
fn recursive_rm_targets(words: &[String]) -> Option<Vec<&str>> {
    let (name, args) = program(words)?;
    if name != "rm" {
        return None;
    }
    let mut recursive = false;
    let mut targets = Vec::new();
    let mut after_dashes = false;
    for a in args {
        if a.starts_with('>') {
            break;
        }
        if !after_dashes && a == "--" {
            after_dashes = true;
        } else if !after_dashes && a.starts_with('-') {
            recursive |= is_recursive_flag(a);
        } else {
            targets.push(a.as_str());
        }
    }
    recursive.then_some(targets)
}

/// Paths a simple command writes to: redirect targets, `tee` arguments and
/// the destination of `cp`/`mv`/`install`.
fn written_paths(words: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut iter = words.iter().peekable();
    while let Some(w) = iter.next() {
        if w == ">" || w == ">>" {
            if let Some(target) = iter.next() {
                out.push(target.as_str());
            }
        }
    }
    if let Some((name, args)) = program(words) {
        let plain: Vec<&str> = args
            .iter()
            .take_while(|a| !a.starts_with('>'))
            .filter(|a| !a.starts_with('-'))
            .map(String::as_str)
            .collect();
        match name {
            "tee" => out.extend(plain),
            "cp" | "mv" | "install" => {
                if plain.len() >= 2 {
                    out.extend(plain.last().copied());
                }
            }
            _ => {}
        }
    }
    out
}

/// Reason to block `command`, or `None` when it is safe.
pub fn check_shell(command: &str, guard: &GuardConfig) -> Option<String> {
    for re in &guard.compiled().deny {
        if re.is_match(command) {
            return Some(format!("command matches deny pattern '{}'", re.as_str()));
        }
    }
    for words in split_commands(command) {
        if let Some(targets) = recursive_rm_targets(&words) {
            if targets.is_empty() {
                continue;
            }
            if let Some(bad) = targets.iter().find(|t| !guard.is_scratch(t)) {
                return Some(format!(
                    "recursive delete of '{bad}' outside scratch paths ({})",
                    guard.scratch_paths.join(", ")
                ));
            }
        }
        if let Some(path) = written_paths(&words)
            .into_iter()
            .find(|p| guard.is_credential_path(p))
        {
            return Some(format!("shell command writes to credential file '{path}'"));
        }
    }
    None
}

/// Reason to block a direct write to any of `paths`, or `None`.
pub fn check_write_paths(paths: &[String], guard: &GuardConfig) -> Option<String> {
    paths
        .iter()
        .find(|p| guard.is_credential_path(p))
        .map(|p| format!("write to credential file '{p}'"))
}
