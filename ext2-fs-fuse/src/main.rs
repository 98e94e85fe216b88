use clap::{App, Arg};
use ext2_fs::{format, BlockDevice, DeviceError, Ext2FileSystem, FormatOptions, MountOptions};
use log::info;
use std::fs::{read_dir, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::Mutex;

const SECTOR_SIZE: usize = 512;

/// A regular file used as an ext2 block device
struct BlockFile {
    file: Mutex<File>,
    size: u64,
}

impl BlockFile {
    fn new(file: File) -> std::io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl BlockDevice for BlockFile {
    fn device_size(&self) -> u64 {
        self.size
    }

    fn write_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        let mut file = self.file.lock().map_err(|_| DeviceError::Read)?;
        file.seek(SeekFrom::Start((block_id * buf.len()) as u64))
            .map_err(|_| DeviceError::OutOfRange(block_id))?;
        file.read_exact(buf).map_err(|_| DeviceError::Read)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError> {
        let mut file = self.file.lock().map_err(|_| DeviceError::Write)?;
        file.seek(SeekFrom::Start((block_id * buf.len()) as u64))
            .map_err(|_| DeviceError::OutOfRange(block_id))?;
        file.write_all(buf).map_err(|_| DeviceError::Write)
    }

    fn sync(&self) -> Result<(), DeviceError> {
        let file = self.file.lock().map_err(|_| DeviceError::Sync)?;
        file.sync_data().map_err(|_| DeviceError::Sync)
    }
}

fn main() {
    env_logger::init();
    if let Err(e) = ext2_pack() {
        eprintln!("ext2-fs-fuse: {}", e);
        std::process::exit(1);
    }
}

/// Build `ext2.img` in the target directory from every file of the source directory
fn ext2_pack() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("ext2 packer")
        .arg(
            Arg::with_name("source")
                .short("s")
                .long("source")
                .takes_value(true)
                .help("Executable source dir(with backslash)"),
        )
        .arg(
            Arg::with_name("target")
                .short("t")
                .long("target")
                .takes_value(true)
                .help("Executable target dir(with backslash)"),
        )
        .arg(
            Arg::with_name("blocks")
                .short("b")
                .long("blocks")
                .takes_value(true)
                .default_value("8192")
                .help("Number of blocks of the image"),
        )
        .arg(
            Arg::with_name("block-size")
                .short("B")
                .long("block-size")
                .takes_value(true)
                .default_value("1024")
                .help("Block size in bytes"),
        )
        .arg(
            Arg::with_name("label")
                .short("l")
                .long("label")
                .takes_value(true)
                .default_value("ext2")
                .help("Volume label"),
        )
        .get_matches();
    let src_path = matches.value_of("source").ok_or("missing --source")?;
    let target_path = matches.value_of("target").ok_or("missing --target")?;
    let blocks: u32 = matches.value_of("blocks").unwrap_or("8192").parse()?;
    let block_size: usize = matches.value_of("block-size").unwrap_or("1024").parse()?;
    let label = matches.value_of("label").unwrap_or("ext2");
    println!("src_path = {}\ntarget_path = {}", src_path, target_path);

    let image = format!("{}{}", target_path, "ext2.img");
    let block_file: Arc<dyn BlockDevice> = {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&image)?;
        f.set_len(blocks as u64 * block_size as u64)?;
        Arc::new(BlockFile::new(f)?)
    };
    let options = FormatOptions {
        block_size,
        blocks: Some(blocks),
        uuid: rand::random(),
        ..FormatOptions::default()
    }
    .with_label(label);
    format(&block_file, &options)?;
    let efs = Ext2FileSystem::mount(block_file, MountOptions::default())?;
    let root_inode = Ext2FileSystem::root_inode(&efs)?;
    let apps: Vec<_> = read_dir(src_path)?
        .filter_map(|dir_entry| dir_entry.ok())
        .filter(|dir_entry| dir_entry.path().is_file())
        .filter_map(|dir_entry| dir_entry.file_name().into_string().ok())
        .collect();
    for app in apps {
        // load app data from host file system
        let mut host_file = File::open(format!("{}{}", src_path, app))?;
        let mut all_data: Vec<u8> = Vec::new();
        host_file.read_to_end(&mut all_data)?;
        // create a file in ext2
        let inode = root_inode.create(app.as_str())?;
        // write data to ext2
        let written = inode.write_at(0, all_data.as_slice())?;
        if written < all_data.len() {
            return Err(format!("{}: volume full after {} bytes", app, written).into());
        }
        info!("packed {} ({} bytes)", app, written);
    }
    // list apps
    for app in root_inode.ls()? {
        println!("{}", app);
    }
    drop(root_inode);
    efs.lock().unmount()?;
    Ok(())
}

#[test]
fn ext2_test() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = std::env::temp_dir().join(format!("ext2-test-{}.img", std::process::id()));
    let block_file: Arc<dyn BlockDevice> = {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        f.set_len(8192 * 1024)?;
        Arc::new(BlockFile::new(f)?)
    };
    format(&block_file, &FormatOptions::default())?;
    let efs = Ext2FileSystem::mount(block_file.clone(), MountOptions::default())?;
    let root_inode = Ext2FileSystem::root_inode(&efs)?;
    root_inode.create("filea")?;
    root_inode.create("fileb")?;
    for name in root_inode.ls()? {
        println!("{}", name);
    }
    let filea = root_inode.find("filea")?;
    let greet_str = "Hello, world!";
    filea.write_at(0, greet_str.as_bytes())?;
    let mut buffer = [0u8; 233];
    let len = filea.read_at(0, &mut buffer)?;
    assert_eq!(greet_str, core::str::from_utf8(&buffer[..len])?);

    let mut random_str_test = |len: usize| -> Result<(), Box<dyn std::error::Error>> {
        filea.clear()?;
        assert_eq!(filea.read_at(0, &mut buffer)?, 0);
        let mut str = String::new();
        // random digit
        for _ in 0..len {
            str.push(char::from('0' as u8 + rand::random::<u8>() % 10));
        }
        filea.write_at(0, str.as_bytes())?;
        let mut read_buffer = [0u8; 127];
        let mut offset = 0usize;
        let mut read_str = String::new();
        loop {
            let len = filea.read_at(offset, &mut read_buffer)?;
            if len == 0 {
                break;
            }
            offset += len;
            read_str.push_str(core::str::from_utf8(&read_buffer[..len])?);
        }
        assert_eq!(str, read_str);
        Ok(())
    };

    random_str_test(4 * 1024)?;
    random_str_test(8 * 1024 + 1024 / 2)?;
    random_str_test(100 * 1024)?;
    random_str_test(70 * 1024 + 1024 / 7)?;
    random_str_test((12 + 256) * 1024)?;
    random_str_test((12 + 256 + 256 * 3) * 1024)?;
    drop(random_str_test);

    let dir = root_inode.mkdir("dir")?;
    dir.create("nested")?;
    assert_eq!(dir.ls()?, vec!["nested".to_string()]);
    drop((filea, dir, root_inode));
    efs.lock().unmount()?;
    drop(efs);

    // everything survives a remount
    let efs = Ext2FileSystem::mount(block_file, MountOptions::default())?;
    let nested = Ext2FileSystem::open(&efs, "/dir/nested")?;
    assert_eq!(nested.stat()?.size, 0);
    let usage = efs.lock().bitmap_usage()?;
    assert!(usage.is_consistent());
    drop(nested);
    drop(efs);
    std::fs::remove_file(&path)?;
    Ok(())
}
