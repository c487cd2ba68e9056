//! On-disk zarr trees produced by complete acquisitions.
//!
//! These run the whole pipeline: simulated camera, stream task, chunker,
//! and sink, then inspect the files a reader would see.

use rust_acq::config::Settings;
use rust_acq::core::VideoFrame;
use rust_acq::properties::{StorageDimension, VideoStreamProperties};
use rust_acq::runtime::{setup, Runtime};
use rust_acq::storage::blosc::BloscCodec;
use rust_acq::storage::multiscale::downsample_half;
use serde_json::{json, Value};
use serial_test::serial;
use std::path::{Path, PathBuf};

/// Run one bounded stream from the given camera into the given zarr sink.
fn acquire(
    storage: &str,
    camera: &str,
    shape: (u32, u32),
    frames: u64,
    dims: Vec<StorageDimension>,
    tweak: impl FnOnce(&mut VideoStreamProperties),
) -> (Runtime, tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("out.zarr");

    let mut runtime = Runtime::new(Settings::default()).unwrap();
    let mut properties = setup(&mut runtime, camera, storage).unwrap();
    let stream = &mut properties.video[0];
    stream.camera.settings.shape = shape;
    stream.max_frame_count = frames;
    stream.storage.settings.uri = root.to_str().unwrap().to_string();
    stream.storage.settings.acquisition_dimensions = dims;
    tweak(stream);
    runtime.apply_configuration(&properties).unwrap();

    runtime.start().unwrap();
    runtime.stop().unwrap();
    (runtime, dir, root)
}

fn read_json(path: &Path) -> Value {
    let text = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&text).unwrap()
}

/// Every chunk file below `dir`, skipping zarr metadata files.
fn chunk_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_str().unwrap().to_string();
            if path.is_dir() {
                stack.push(path);
            } else if !name.starts_with('.') && name != "zarr.json" {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn full_hd_dims() -> Vec<StorageDimension> {
    vec![
        StorageDimension::space("x", 1920, 960),
        StorageDimension::space("y", 1080, 540),
        StorageDimension::time("t", 0, 64),
    ]
}

#[test]
#[serial]
fn test_v2_chunk_grid_at_full_hd() {
    let (_runtime, _dir, root) = acquire(
        "Zarr",
        "simulated.*empty",
        (1920, 1080),
        64,
        full_hd_dims(),
        |_| {},
    );

    assert_eq!(read_json(&root.join(".zgroup")), json!({"zarr_format": 2}));

    let zarray = read_json(&root.join("0").join(".zarray"));
    assert_eq!(zarray["zarr_format"], json!(2));
    assert_eq!(zarray["shape"], json!([64, 1080, 1920]));
    assert_eq!(zarray["chunks"], json!([64, 540, 960]));
    assert_eq!(zarray["dtype"], json!("|u1"));
    assert_eq!(zarray["compressor"], Value::Null);
    assert_eq!(zarray["fill_value"], json!(0));
    assert_eq!(zarray["order"], json!("C"));
    assert_eq!(zarray["dimension_separator"], json!("/"));

    // One t row of a 2x2 spatial grid.
    let files = chunk_files(&root);
    assert_eq!(files.len(), 4);
    for file in &files {
        assert_eq!(
            std::fs::metadata(file).unwrap().len(),
            64 * 540 * 960,
            "{}",
            file.display()
        );
    }
}

#[test]
#[serial]
fn test_v2_partial_append_chunk_is_written_unpadded() {
    let (_runtime, _dir, root) = acquire(
        "Zarr",
        "simulated.*empty",
        (1920, 1080),
        65,
        full_hd_dims(),
        |_| {},
    );

    let zarray = read_json(&root.join("0").join(".zarray"));
    assert_eq!(zarray["shape"], json!([65, 1080, 1920]));

    // The 65th frame opens a second t row: four more files, one frame deep.
    let files = chunk_files(&root);
    assert_eq!(files.len(), 8);
    let full = files
        .iter()
        .filter(|f| std::fs::metadata(f).unwrap().len() == 64 * 540 * 960)
        .count();
    let partial = files
        .iter()
        .filter(|f| std::fs::metadata(f).unwrap().len() == 540 * 960)
        .count();
    assert_eq!(full, 4);
    assert_eq!(partial, 4);
}

#[test]
fn test_v2_compressed_chunks_decode_back() {
    let dims = vec![
        StorageDimension::space("x", 64, 64),
        StorageDimension::space("y", 64, 64),
        StorageDimension::time("t", 0, 8),
    ];
    let (_runtime, _dir, root) = acquire(
        "ZarrBlosc1ZstdByteShuffle",
        "simulated.*empty",
        (64, 64),
        8,
        dims,
        |_| {},
    );

    let zarray = read_json(&root.join("0").join(".zarray"));
    assert_eq!(
        zarray["compressor"],
        json!({"id": "blosc", "cname": "zstd", "clevel": 1, "shuffle": 1, "blocksize": 0})
    );

    let files = chunk_files(&root);
    assert_eq!(files.len(), 1);
    let encoded = std::fs::read(&files[0]).unwrap();
    let decoded = BloscCodec::decode(&encoded).unwrap();
    assert_eq!(decoded, vec![0u8; 8 * 64 * 64]);
}

#[test]
fn test_v2_lz4_variant_names_its_codec() {
    let dims = vec![
        StorageDimension::space("x", 32, 32),
        StorageDimension::space("y", 32, 32),
        StorageDimension::time("t", 0, 4),
    ];
    let (_runtime, _dir, root) = acquire(
        "ZarrBlosc1Lz4ByteShuffle",
        "simulated.*empty",
        (32, 32),
        4,
        dims,
        |_| {},
    );

    let zarray = read_json(&root.join("0").join(".zarray"));
    assert_eq!(zarray["compressor"]["cname"], json!("lz4"));

    let encoded = std::fs::read(&chunk_files(&root)[0]).unwrap();
    assert_eq!(BloscCodec::decode(&encoded).unwrap(), vec![0u8; 4 * 32 * 32]);
}

#[test]
fn test_v2_ome_attributes_and_external_metadata() {
    let dims = vec![
        StorageDimension::space("x", 64, 64),
        StorageDimension::space("y", 64, 64),
        StorageDimension::time("t", 0, 4),
    ];
    let (_runtime, _dir, root) = acquire(
        "Zarr",
        "simulated.*empty",
        (64, 64),
        4,
        dims,
        |stream| {
            stream.storage.settings.pixel_scale_um = (0.5, 4.0);
            stream.storage.settings.external_metadata_json =
                Some("  {\"instrument\": \"sim\"}  ".to_string());
        },
    );

    let attrs = read_json(&root.join(".zattrs"));
    let multiscales = &attrs["multiscales"][0];
    assert_eq!(multiscales["version"], json!("0.4"));
    assert_eq!(
        multiscales["axes"],
        json!([
            {"name": "t", "type": "time"},
            {"name": "y", "type": "space", "unit": "micrometer"},
            {"name": "x", "type": "space", "unit": "micrometer"},
        ])
    );
    assert_eq!(multiscales["datasets"][0]["path"], json!("0"));
    assert_eq!(
        multiscales["datasets"][0]["coordinateTransformations"][0]["scale"],
        json!([1.0, 4.0, 0.5])
    );

    // Caller metadata lands verbatim on the base level, trimmed.
    assert_eq!(
        read_json(&root.join("0").join(".zattrs")),
        json!({"instrument": "sim"})
    );
}

#[test]
#[serial]
fn test_v2_multiscale_pyramid() {
    let dims = vec![
        StorageDimension::space("x", 1920, 640),
        StorageDimension::space("y", 1080, 360),
        StorageDimension::time("t", 0, 2),
    ];
    let (runtime, _dir, root) = acquire(
        "Zarr",
        "simulated.*sin",
        (1920, 1080),
        2,
        dims,
        |stream| {
            stream.storage.settings.enable_multiscale = true;
        },
    );

    // 1920x1080 halves twice before a level fits inside one 640x360 chunk.
    assert!(root.join("2").join(".zarray").exists());
    assert!(!root.join("3").exists());
    let shapes: Vec<Value> = (0..3)
        .map(|level| read_json(&root.join(level.to_string()).join(".zarray"))["shape"].clone())
        .collect();
    assert_eq!(shapes[0], json!([2, 1080, 1920]));
    assert_eq!(shapes[1], json!([2, 540, 960]));
    assert_eq!(shapes[2], json!([2, 270, 480]));

    assert_eq!(chunk_files(&root.join("0")).len(), 9);
    assert_eq!(chunk_files(&root.join("1")).len(), 4);
    assert_eq!(chunk_files(&root.join("2")).len(), 1);

    let attrs = read_json(&root.join(".zattrs"));
    let datasets = &attrs["multiscales"][0]["datasets"];
    assert_eq!(datasets[1]["path"], json!("1"));
    assert_eq!(
        datasets[1]["coordinateTransformations"][0]["scale"],
        json!([1.0, 2.0, 2.0])
    );
    assert_eq!(
        datasets[2]["coordinateTransformations"][0]["scale"],
        json!([1.0, 4.0, 4.0])
    );

    // The coarsest level is one chunk; its bytes are the captured frames
    // box-averaged twice.
    let mut expected = Vec::new();
    let packet = runtime.get_available_data(0).unwrap();
    assert_eq!(packet.frame_count(), 2);
    for handle in packet.frames() {
        let frame = VideoFrame {
            metadata: handle.metadata().unwrap(),
            shape: handle.shape().unwrap(),
            sample_type: handle.sample_type().unwrap(),
            data: handle.data().unwrap(),
        };
        let coarse = downsample_half(&downsample_half(&frame));
        assert_eq!(coarse.shape, (480, 270));
        expected.extend_from_slice(&coarse.data);
    }
    let level2 = std::fs::read(&chunk_files(&root.join("2"))[0]).unwrap();
    assert_eq!(level2, expected);
}

#[test]
fn test_v3_array_metadata_and_shard_layout() {
    let dims = vec![
        StorageDimension::space("x", 64, 32).with_shard(2),
        StorageDimension::space("y", 64, 32).with_shard(2),
        StorageDimension::time("t", 0, 4),
    ];
    let (_runtime, _dir, root) = acquire(
        "ZarrV3",
        "simulated.*empty",
        (64, 64),
        4,
        dims,
        |_| {},
    );

    let group = read_json(&root.join("zarr.json"));
    assert_eq!(group["zarr_format"], json!(3));
    assert_eq!(group["node_type"], json!("group"));

    let array = read_json(&root.join("0").join("zarr.json"));
    assert_eq!(array["node_type"], json!("array"));
    assert_eq!(array["shape"], json!([4, 64, 64]));
    assert_eq!(array["data_type"], json!("uint8"));
    assert_eq!(array["dimension_names"], json!(["t", "y", "x"]));
    // The outer grid is shards; inner chunks live in the sharding codec.
    assert_eq!(
        array["chunk_grid"]["configuration"]["chunk_shape"],
        json!([4, 64, 64])
    );
    let sharding = &array["codecs"][0];
    assert_eq!(sharding["name"], json!("sharding_indexed"));
    assert_eq!(
        sharding["configuration"]["chunk_shape"],
        json!([4, 32, 32])
    );
    assert_eq!(sharding["configuration"]["index_location"], json!("end"));

    // One shard holding a 2x2 spatial grid of inner chunks plus its index.
    let files = chunk_files(&root);
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with(Path::new("0/c/0/0/0")));
    let shard = std::fs::read(&files[0]).unwrap();
    let chunk_bytes = 4 * 32 * 32;
    assert_eq!(shard.len(), 4 * chunk_bytes + 4 * 16 + 4);

    // Index entries cover the payload back to back, none missing.
    let index = &shard[4 * chunk_bytes..shard.len() - 4];
    let mut offsets = Vec::new();
    for entry in index.chunks(16) {
        let offset = u64::from_le_bytes(entry[..8].try_into().unwrap());
        let nbytes = u64::from_le_bytes(entry[8..].try_into().unwrap());
        assert_eq!(nbytes, chunk_bytes as u64);
        offsets.push(offset);
    }
    offsets.sort_unstable();
    assert_eq!(
        offsets,
        vec![0, chunk_bytes as u64, 2 * chunk_bytes as u64, 3 * chunk_bytes as u64]
    );

    let stored_crc = u32::from_le_bytes(shard[shard.len() - 4..].try_into().unwrap());
    assert_eq!(stored_crc, crc32c::crc32c(index));
}

#[test]
#[serial]
fn test_v3_full_hd_shards_split_on_append_rollover() {
    let dims = vec![
        StorageDimension::space("x", 1920, 960).with_shard(2),
        StorageDimension::space("y", 1080, 540).with_shard(2),
        StorageDimension::time("t", 0, 64).with_shard(1),
    ];
    let (_runtime, _dir, root) = acquire(
        "ZarrV3",
        "simulated.*empty",
        (1920, 1080),
        65,
        dims,
        |_| {},
    );

    let array = read_json(&root.join("0").join("zarr.json"));
    assert_eq!(array["shape"], json!([65, 1080, 1920]));
    assert_eq!(
        array["chunk_grid"]["configuration"]["chunk_shape"],
        json!([64, 1080, 1920])
    );
    assert_eq!(
        array["codecs"][0]["configuration"]["chunk_shape"],
        json!([64, 540, 960])
    );

    // The 2x2 spatial grid shares one shard per t row; frame 65 opens a
    // second row and with it a second shard file.
    let files = chunk_files(&root);
    assert_eq!(files.len(), 2);
    assert!(files[0].ends_with(Path::new("0/c/0/0/0")));
    assert!(files[1].ends_with(Path::new("0/c/1/0/0")));

    let full_chunk = 64 * 540 * 960u64;
    let partial_chunk = 540 * 960u64;
    let index_bytes = 4 * 16 + 4;
    assert_eq!(
        std::fs::metadata(&files[0]).unwrap().len(),
        4 * full_chunk + index_bytes
    );
    assert_eq!(
        std::fs::metadata(&files[1]).unwrap().len(),
        4 * partial_chunk + index_bytes
    );

    // Every slot of the trailing shard holds a one-frame chunk.
    let shard = std::fs::read(&files[1]).unwrap();
    let index = &shard[shard.len() - 68..shard.len() - 4];
    for entry in index.chunks(16) {
        let nbytes = u64::from_le_bytes(entry[8..].try_into().unwrap());
        assert_eq!(nbytes, partial_chunk);
    }
}

#[test]
fn test_v3_compressed_inner_chunks_decode_back() {
    let dims = vec![
        StorageDimension::space("x", 32, 32),
        StorageDimension::space("y", 32, 32),
        StorageDimension::time("t", 0, 4),
    ];
    let (_runtime, _dir, root) = acquire(
        "ZarrV3Blosc1ZstdByteShuffle",
        "simulated.*empty",
        (32, 32),
        4,
        dims,
        |_| {},
    );

    let array = read_json(&root.join("0").join("zarr.json"));
    let inner_codecs = &array["codecs"][0]["configuration"]["codecs"];
    assert_eq!(inner_codecs[0]["name"], json!("bytes"));
    assert_eq!(inner_codecs[1]["name"], json!("blosc"));
    assert_eq!(inner_codecs[1]["configuration"]["cname"], json!("zstd"));
    assert_eq!(inner_codecs[1]["configuration"]["clevel"], json!(1));
    assert_eq!(inner_codecs[1]["configuration"]["shuffle"], json!("shuffle"));

    // Unsharded dimensions still produce one-chunk shards with an index.
    let files = chunk_files(&root);
    assert_eq!(files.len(), 1);
    let shard = std::fs::read(&files[0]).unwrap();
    let index = &shard[shard.len() - 20..shard.len() - 4];
    let offset = u64::from_le_bytes(index[..8].try_into().unwrap());
    let nbytes = u64::from_le_bytes(index[8..].try_into().unwrap());
    assert_eq!(offset, 0);
    assert_eq!(nbytes as usize, shard.len() - 20);

    let decoded = BloscCodec::decode(&shard[..nbytes as usize]).unwrap();
    assert_eq!(decoded, vec![0u8; 4 * 32 * 32]);
}
