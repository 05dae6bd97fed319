//! Tests for behavior around missing files.

use super::*;

#[test]
fn missing_file_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a", "1\n")?;

    let out = space.run(&mut skein_command(vec!["a", "nope"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "skein: error:");
    assert_output_contains(&out, "nope: no such file");
    assert_output_not_contains(&out, "total");
    Ok(())
}

#[test]
fn keep_going_reports_the_rest() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a", "1\n2\n")?;

    let out = space.run(&mut skein_command(vec!["-k", "a", "nope"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "nope: no such file");
    assert_output_contains(&out, "       2 a\n");
    Ok(())
}
