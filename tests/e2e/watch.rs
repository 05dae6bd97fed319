//! Tests for --watch, where changed paths arrive on stdin.

use super::*;
use std::io::{BufRead, BufReader, Write};
use std::process::Stdio;

/// Reads stdout up to and including the next build summary.
fn read_build(out: &mut impl BufRead) -> anyhow::Result<String> {
    let mut text = String::new();
    loop {
        let mut line = String::new();
        if out.read_line(&mut line)? == 0 {
            anyhow::bail!("skein exited early; output so far:\n{}", text);
        }
        text.push_str(&line);
        if line.starts_with("skein: ") && line.contains(" computed, ") {
            return Ok(text);
        }
    }
}

#[test]
fn rebuilds_reported_changes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a", "1\n2\n")?;

    let mut child = skein_command(vec!["--watch", "a"])
        .current_dir(space.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    let first = read_build(&mut stdout)?;
    assert!(first.contains("       2 a\n"), "{}", first);

    // Nothing reported, nothing recomputed.
    writeln!(stdin)?;
    let second = read_build(&mut stdout)?;
    assert!(second.contains("skein: 0 computed, 0 up to date"), "{}", second);

    space.write("a", "1\n2\n3\n")?;
    writeln!(stdin, "a")?;
    writeln!(stdin)?;
    let third = read_build(&mut stdout)?;
    assert!(third.contains("       3 a\n"), "{}", third);
    assert!(third.contains("       3 total\n"), "{}", third);

    drop(stdin);
    let status = child.wait()?;
    assert!(status.success());
    Ok(())
}
