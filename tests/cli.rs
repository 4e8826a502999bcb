use std::{
    io::{ErrorKind, Read, Write},
    process::{Command, Output, Stdio},
};

use flate2::read::ZlibDecoder;
use similar_asserts::assert_eq;

fn stagepipe(args: &[&str], input: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_stagepipe"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    // a command that fails before reading closes its stdin early
    if let Err(e) = child.stdin.take().unwrap().write_all(input) {
        assert_eq!(e.kind(), ErrorKind::BrokenPipe);
    }
    child.wait_with_output().unwrap()
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).unwrap()
}

fn archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(vec![]);
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(5);
    builder.append_data(&mut header, "a.txt", &b"hello"[..]).unwrap();
    builder.into_inner().unwrap()
}

#[test]
fn test_secretz() {
    let cipher = ["aes256", "0123456789abcdef0123456789abcdef", "fedcba9876543210"];
    let encrypted = stagepipe(&[&["encrypt"][..], &cipher[..]].concat(), &archive());
    assert!(encrypted.status.success());

    let report = stagepipe(&[&["secretz"][..], &cipher[..]].concat(), &encrypted.stdout);
    assert_eq!(stdout(&report), "5d41402abc4b2a76b9719d911017c592 a.txt\n");
}

#[test]
fn test_bad_key_length_fails() {
    let output = stagepipe(&["decrypt", "aes-256-cbc", "short", "alsoshort"], b"");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cipher failure"));
}

#[test]
fn test_group_negotiated_deflate() {
    let input = b"{\"type\":\"genre\",\"name\":\"g\"}\n{\"type\":\"book\",\"name\":\"b\"}\n";
    let output = stagepipe(&["group", "--accept", "br;q=0.2, deflate;q=0.5"], input);
    assert!(output.status.success());
    let mut out = String::new();
    ZlibDecoder::new(&output.stdout[..])
        .read_to_string(&mut out)
        .unwrap();
    assert_eq!(out, "{\"name\":\"g\",\"books\":[\"b\"]}\n");

    let refused = stagepipe(&["group", "--accept", "compress, identity"], input);
    assert!(!refused.status.success());
    assert!(String::from_utf8_lossy(&refused.stderr).contains("unsupported encoding"));
}

#[test]
fn test_text_commands() {
    assert_eq!(stdout(&stagepipe(&["upper"], b"beep\n")), "BEEP\n");
    assert_eq!(stdout(&stagepipe(&["lines"], b"a\nb\nc")), "a\nB\nc\n");
    assert_eq!(
        stdout(&stagepipe(&["rewrite", ".loud"], b"<i class=loud>x</i>y")),
        "<i class=loud>X</i>y"
    );
    assert_eq!(
        stdout(&stagepipe(
            &["tally", "country"],
            b"{\"country\":\"NZ\"}\n{\"country\":\"AU\"}\n{\"country\":\"NZ\"}\n"
        )),
        "AU 1\nNZ 2\n"
    );
}
