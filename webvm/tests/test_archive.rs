use std::io;

use webvm::archive::{parse_tar, TarEntryType};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test]
fn test_archive_reads_tar_crate_output() -> anyhow::Result<()> {
    let long_path = format!("{}/{}.txt", "a".repeat(80), "b".repeat(60));

    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, "site/")?;
    append_file(&mut builder, "site/index.html", b"<h1>hello</h1>")?;
    append_file(&mut builder, "site/empty.txt", b"")?;
    append_symlink(&mut builder, "site/latest", "index.html")?;
    append_file(&mut builder, &long_path, b"deep")?;
    let bytes = builder.into_inner()?;

    let entries = parse_tar(&bytes)?;
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["site/", "site/index.html", "site/empty.txt", long_path.as_str()]
    );

    assert_eq!(entries[0].entry_type, TarEntryType::Directory);
    assert!(entries[0].data.is_empty());

    assert!(entries[1].is_file());
    assert_eq!(entries[1].size, 14);
    assert_eq!(&entries[1].data[..], b"<h1>hello</h1>");

    assert_eq!(entries[2].size, 0);
    assert_eq!(&entries[3].data[..], b"deep");

    Ok(())
}

#[test]
fn test_archive_rejects_truncated_tar_crate_output() -> anyhow::Result<()> {
    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "big.bin", &[7u8; 2048])?;
    let bytes = builder.into_inner()?;

    assert!(parse_tar(&bytes[..1024]).is_err());
    assert!(parse_tar(&bytes[..100]).is_err());

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data)
}

fn append_dir(builder: &mut tar::Builder<Vec<u8>>, path: &str) -> io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, path, io::empty())
}

fn append_symlink(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    target: &str,
) -> io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_link_name(target)?;
    header.set_size(0);
    header.set_mode(0o777);
    header.set_cksum();
    builder.append_data(&mut header, path, io::empty())
}
