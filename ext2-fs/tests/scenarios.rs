mod common;

use common::*;
use ext2_fs::{Ext2Error, Ext2FileSystem, StatMode};

fn long_name(i: usize) -> String {
    format!("{:0>48}", i)
}

#[test]
fn write_close_reopen_read() {
    let disk = fresh_disk(64, 1024, 512);
    let data: Vec<u8> = (0..2000u32).map(|i| (i * 7 % 251) as u8).collect();
    {
        let fs = mount(&disk);
        let root = Ext2FileSystem::root_inode(&fs).unwrap();
        let file = root.create("a").unwrap();
        assert_eq!(file.write_at(0, &data).unwrap(), 2000);
        file.close().unwrap();
        root.close().unwrap();
        fs.lock().unmount().unwrap();
    }
    let fs = mount(&disk);
    let file = Ext2FileSystem::open(&fs, "/a").unwrap();
    let mut buf = vec![0u8; 4096];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 2000);
    assert_eq!(&buf[..2000], &data[..]);
    let stat = file.stat().unwrap();
    assert_eq!(stat.size, 2000);
    assert_eq!(stat.mode, StatMode::FILE);
    assert_eq!(stat.nlink, 1);
    // two 1 KiB blocks
    assert_eq!(stat.blocks, 4);
}

#[test]
fn directory_grows_and_shrinks() {
    let disk = roomy_disk(64, 64, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let dir = root.mkdir("d").unwrap();
    for i in 0..20 {
        dir.create(&long_name(i)).unwrap();
    }
    assert_eq!(dir.stat().unwrap().size, 2048);
    assert_eq!(dir.ls().unwrap().len(), 20);
    for i in (10..20).rev() {
        dir.unlink(&long_name(i)).unwrap();
    }
    for i in 0..10 {
        assert!(dir.find(&long_name(i)).is_ok(), "{} lost", i);
    }
    for i in 10..20 {
        assert_eq!(dir.find(&long_name(i)).err(), Some(Ext2Error::NotFound));
    }
    let stat = dir.stat().unwrap();
    assert_eq!(stat.size, 1024);
    assert_eq!(stat.blocks, 2);
    let usage = fs.lock().bitmap_usage().unwrap();
    assert!(usage.is_consistent());
}

#[test]
fn released_middle_block_is_replaced_by_last() {
    let disk = roomy_disk(64, 64, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let dir = root.mkdir("d").unwrap();
    let name = |i: usize| format!("{:0>200}", i);
    // four 208-byte records per block
    for i in 0..9 {
        dir.create(&name(i)).unwrap();
    }
    assert_eq!(dir.stat().unwrap().size, 3072);
    let before = free_blocks(&fs);
    for i in [5, 6, 7, 4] {
        dir.unlink(&name(i)).unwrap();
    }
    assert_eq!(dir.stat().unwrap().size, 2048);
    assert_eq!(free_blocks(&fs), before + 1);
    for i in [0, 1, 2, 3, 8] {
        assert!(dir.find(&name(i)).is_ok(), "{} lost", i);
    }
    // the moved block still takes new entries
    dir.create("tail").unwrap();
    assert_eq!(dir.stat().unwrap().size, 2048);
}

#[test]
fn truncate_returns_every_block() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let file = root.create("ten").unwrap();
    let before = free_blocks(&fs);
    file.write_at(0, &vec![0xab; 10 * 1024]).unwrap();
    assert_eq!(free_blocks(&fs), before - 10);
    assert_eq!(file.stat().unwrap().blocks, 20);
    file.truncate(0).unwrap();
    let stat = file.stat().unwrap();
    assert_eq!(stat.size, 0);
    assert_eq!(stat.blocks, 0);
    assert_eq!(free_blocks(&fs), before);
    assert!(fs.lock().bitmap_usage().unwrap().is_consistent());
}

#[test]
fn truncate_through_indirect_blocks() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let file = root.create("twenty").unwrap();
    let before = free_blocks(&fs);
    let data: Vec<u8> = (0..20 * 1024).map(|i| (i % 13) as u8).collect();
    file.write_at(0, &data).unwrap();
    // twenty data blocks and one index block
    assert_eq!(free_blocks(&fs), before - 21);
    assert_eq!(file.stat().unwrap().blocks, 40);

    file.truncate(13 * 1024 + 100).unwrap();
    assert_eq!(free_blocks(&fs), before - 15);
    assert_eq!(file.stat().unwrap().blocks, 28);
    let mut buf = vec![0u8; 1024];
    assert_eq!(file.read_at(13 * 1024, &mut buf).unwrap(), 100);
    assert_eq!(&buf[..100], &data[13 * 1024..13 * 1024 + 100]);

    // growing again exposes zeroes, not stale bytes
    file.truncate(14 * 1024).unwrap();
    assert_eq!(file.read_at(13 * 1024, &mut buf).unwrap(), 1024);
    assert_eq!(&buf[..100], &data[13 * 1024..13 * 1024 + 100]);
    assert!(buf[100..].iter().all(|b| *b == 0));

    file.truncate(12 * 1024).unwrap();
    // the index block goes with its last entry
    assert_eq!(free_blocks(&fs), before - 12);
    file.truncate(0).unwrap();
    assert_eq!(free_blocks(&fs), before);
}

#[test]
fn unlinked_file_lives_until_last_close() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let free_inodes = fs.lock().statfs().unwrap().free_inodes;
    let before = free_blocks(&fs);
    let file = root.create("victim").unwrap();
    file.write_at(0, b"still here").unwrap();
    let other = file.try_clone().unwrap();
    assert_eq!(fs.lock().inode_refs(file.handle()).unwrap(), 2);

    root.unlink("victim").unwrap();
    assert_eq!(root.find("victim").err(), Some(Ext2Error::NotFound));
    let mut buf = [0u8; 10];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"still here");
    assert_eq!(file.stat().unwrap().nlink, 0);

    file.close().unwrap();
    assert_eq!(fs.lock().statfs().unwrap().free_inodes, free_inodes - 1);
    assert_eq!(free_blocks(&fs), before - 1);
    other.close().unwrap();
    assert_eq!(fs.lock().statfs().unwrap().free_inodes, free_inodes);
    assert_eq!(free_blocks(&fs), before);
}

#[test]
fn sparse_file_reaches_triple_indirect() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let file = root.create("sparse").unwrap();
    let before = free_blocks(&fs);

    // first block behind the double indirect root
    let double = (12 + 256) * 1024;
    file.write_at(double, b"two").unwrap();
    assert_eq!(free_blocks(&fs), before - 3);
    // first block behind the triple indirect root
    let triple = (12 + 256 + 256 * 256) * 1024;
    file.write_at(triple, b"three").unwrap();
    assert_eq!(free_blocks(&fs), before - 7);
    let stat = file.stat().unwrap();
    assert_eq!(stat.size, triple as u64 + 5);
    assert_eq!(stat.blocks, 4);

    let mut buf = [0xffu8; 5];
    file.read_at(triple, &mut buf).unwrap();
    assert_eq!(&buf, b"three");
    file.read_at(double, &mut buf[..3]).unwrap();
    assert_eq!(&buf[..3], b"two");
    // holes read as zeroes
    file.read_at(double + 4096, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 5]);

    file.truncate(0).unwrap();
    assert_eq!(free_blocks(&fs), before);
    assert_eq!(file.stat().unwrap().blocks, 0);
}

#[test]
fn rename_within_and_across_directories() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let file = root.create("old").unwrap();
    file.write_at(0, b"payload").unwrap();
    let ino = file.ino();
    drop(file);

    root.rename("old", &root, "new").unwrap();
    assert_eq!(root.find("old").err(), Some(Ext2Error::NotFound));
    assert_eq!(root.find("new").unwrap().ino(), ino);

    let a = root.mkdir("a").unwrap();
    let b = root.mkdir("b").unwrap();
    let sub = a.mkdir("sub").unwrap();
    drop(sub);
    assert_eq!(a.stat().unwrap().nlink, 3);
    a.rename("sub", &b, "moved").unwrap();
    assert_eq!(a.stat().unwrap().nlink, 2);
    assert_eq!(b.stat().unwrap().nlink, 3);
    let moved = Ext2FileSystem::open(&fs, "/b/moved").unwrap();
    let parent = moved.find("..").unwrap();
    assert_eq!(parent.ino(), b.ino());

    // a directory can't go below itself
    assert!(root.rename("b", &moved, "loop").is_err());

    // replacing an existing file frees it
    root.create("other").unwrap();
    root.rename("new", &root, "other").unwrap();
    assert_eq!(root.find("other").unwrap().ino(), ino);
    assert_eq!(root.find("new").err(), Some(Ext2Error::NotFound));
    drop((moved, parent, a, b, root));
    assert!(fs.lock().bitmap_usage().unwrap().is_consistent());
}

#[test]
fn rmdir_checks_emptiness() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let free_inodes = fs.lock().statfs().unwrap().free_inodes;
    let dir = root.mkdir("d").unwrap();
    dir.create("f").unwrap();
    assert_eq!(root.rmdir("d").err(), Some(Ext2Error::NotEmpty));
    assert_eq!(root.unlink("d").err(), Some(Ext2Error::IsDir));
    assert_eq!(dir.rmdir("f").err(), Some(Ext2Error::NotDir));
    dir.unlink("f").unwrap();
    drop(dir);
    assert_eq!(root.stat().unwrap().nlink, 4);
    root.rmdir("d").unwrap();
    assert_eq!(root.stat().unwrap().nlink, 3);
    assert_eq!(fs.lock().statfs().unwrap().free_inodes, free_inodes);
}

#[test]
fn hard_links_share_the_inode() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let file = root.create("one").unwrap();
    file.write_at(0, b"shared").unwrap();
    root.link("one", "two").unwrap();
    assert_eq!(file.stat().unwrap().nlink, 2);
    root.unlink("one").unwrap();
    let two = root.find("two").unwrap();
    assert_eq!(two.ino(), file.ino());
    let mut buf = [0u8; 6];
    two.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");
    assert_eq!(root.link("two", "two").err(), Some(Ext2Error::Exists));
}

#[test]
fn names_are_validated() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    root.create("x").unwrap();
    assert_eq!(root.create("x").err(), Some(Ext2Error::Exists));
    assert_eq!(
        root.create(&"n".repeat(256)).err(),
        Some(Ext2Error::NameTooLong)
    );
    assert!(root.create(&"n".repeat(255)).is_ok());
    let file = root.find("x").unwrap();
    assert_eq!(file.create("y").err(), Some(Ext2Error::NotDir));
    assert_eq!(
        Ext2FileSystem::open(&fs, "/x/y").err(),
        Some(Ext2Error::NotDir)
    );
    assert_eq!(
        Ext2FileSystem::open(&fs, "/nope/y").err(),
        Some(Ext2Error::NotFound)
    );
    assert_eq!(
        Ext2FileSystem::open(&fs, "/lost+found").unwrap().ino(),
        11
    );
}

#[test]
fn running_out_of_space() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let file = root.create("big").unwrap();
    let free = free_blocks(&fs) as usize;
    let data = vec![1u8; 80 * 1024];
    // one of the free blocks becomes the index block
    let written = file.write_at(0, &data).unwrap();
    assert_eq!(written, (free - 1) * 1024);
    assert_eq!(free_blocks(&fs), 0);
    assert_eq!(file.write_at(written, b"more").err(), Some(Ext2Error::NoSpace));
    assert_eq!(file.stat().unwrap().size, written as u64);
    file.truncate(0).unwrap();
    assert_eq!(free_blocks(&fs) as usize, free);
}

#[test]
fn larger_blocks() {
    let disk = fresh_disk(64, 4096, 4096);
    let fs = mount(&disk);
    assert_eq!(fs.lock().statfs().unwrap().block_size, 4096);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let dir = root.mkdir("d").unwrap();
    let file = dir.create("f").unwrap();
    let data: Vec<u8> = (0..20000u32).map(|i| (i % 17) as u8).collect();
    file.write_at(100, &data).unwrap();
    let mut buf = vec![0u8; 20000];
    assert_eq!(file.read_at(100, &mut buf).unwrap(), 20000);
    assert_eq!(buf, data);
    assert_eq!(file.stat().unwrap().blocks, 5 * 8);
    assert!(fs.lock().bitmap_usage().unwrap().is_consistent());
}

#[test]
fn removed_directory_takes_no_new_entries() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let free_inodes = fs.lock().statfs().unwrap().free_inodes;
    let before = free_blocks(&fs);
    let dir = root.mkdir("d").unwrap();
    let file = root.create("f").unwrap();
    root.rmdir("d").unwrap();
    // the open handle keeps only the dot entries
    assert!(dir.ls().unwrap().is_empty());
    assert_eq!(dir.create("orphan").err(), Some(Ext2Error::NotFound));
    assert_eq!(dir.mkdir("orphan").err(), Some(Ext2Error::NotFound));
    assert_eq!(root.rename("f", &dir, "f").err(), Some(Ext2Error::NotFound));
    assert!(root.find("f").is_ok());
    drop((dir, file));
    root.unlink("f").unwrap();
    assert_eq!(fs.lock().statfs().unwrap().free_inodes, free_inodes);
    assert_eq!(free_blocks(&fs), before);
    assert!(fs.lock().bitmap_usage().unwrap().is_consistent());
}

#[test]
fn reads_past_the_end_are_empty() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let root = Ext2FileSystem::root_inode(&fs).unwrap();
    let file = root.create("short").unwrap();
    file.write_at(0, b"abc").unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(file.read_at(3, &mut buf).unwrap(), 0);
    assert_eq!(file.read_at(usize::MAX - 1, &mut buf).unwrap(), 0);
    assert_eq!(file.read_at(usize::MAX, &mut buf).unwrap(), 0);
    assert_eq!(file.read_at(1, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"bc");
}
