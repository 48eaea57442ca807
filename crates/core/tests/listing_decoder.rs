use std::path::Path;

use statewalk_core::model::InstructionType;
use statewalk_core::services::{
    Architecture, DecodeError, DecodeOptions, Decoder, ImageLoader, ListingDecoder, ListingLoader,
};

#[test]
fn yaml_listing_loads_and_decodes() {
    let doc = r#"
entry: 4096
symbols:
  - { name: main, address: 4096 }
segments:
  - { name: .rodata, address: 32768, bytes: "aa000000" }
instructions:
  - { address: 4096, bytes: "aa00", type: sequential }
  - { address: 4098, bytes: "bb00", type: return }
"#;
    let image = ListingLoader.load(Path::new("image.yaml"), doc.as_bytes()).unwrap();
    assert_eq!(image.arch, Architecture::Listing);
    assert_eq!(image.entry, Some(0x1000));
    assert_eq!(image.segments[0].bytes, vec![0xaa, 0, 0, 0]);

    let out = ListingDecoder.decode(&image, &DecodeOptions::default()).unwrap();
    assert!(out.fault.is_none());
    assert_eq!(out.instructions.len(), 2);
    assert_eq!(out.instructions[1].kind, InstructionType::Return);
}

#[test]
fn empty_encoding_stops_with_fault() {
    let doc = r#"{"instructions":[
        {"address":0,"bytes":"90","type":"sequential"},
        {"address":1,"bytes":"","type":"sequential"},
        {"address":2,"bytes":"c3","type":"return"}]}"#;
    let image = ListingLoader.load(Path::new("image.json"), doc.as_bytes()).unwrap();
    let out = ListingDecoder.decode(&image, &DecodeOptions::default()).unwrap();
    assert_eq!(out.instructions.len(), 1);
    assert!(out.fault.unwrap().contains("0x00000001"));
}

#[test]
fn invalid_hex_is_malformed() {
    let doc = r#"{"instructions":[{"address":0,"bytes":"zz"}]}"#;
    let err = ListingLoader.load(Path::new("image.json"), doc.as_bytes()).unwrap_err();
    assert!(matches!(err, DecodeError::Malformed { .. }));
}
