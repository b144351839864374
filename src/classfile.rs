//! Reading and writing JVM class files.
//!
//! Two views are offered. [`ClassHeader`] stops after the interface table and
//! carries just the facts the hierarchy resolver needs. [`ClassFile`] keeps
//! the whole structure (constant pool entries verbatim, members and
//! attributes as raw blobs) and writes it back byte for byte, which is enough
//! for structural edits such as dropping methods.

use bitflags::bitflags;

use crate::error::ClassFormatError;

pub const MAGIC: u32 = 0xCAFE_BABE;

const TAG_UTF8: u8 = 1;
const TAG_CLASS: u8 = 7;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;

bitflags! {
    /// Class-level access flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

const METHOD_PUBLIC_NATIVE: u16 = 0x0101;

/// `a.b.C` -> `a/b/C`
pub fn internal_name(name: &str) -> String {
    name.replace('.', "/")
}

/// `a/b/C` -> `a.b.C`
pub fn qualified_name(name: &str) -> String {
    name.replace('/', ".")
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ClassFormatError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(ClassFormatError::Truncated {
                offset: self.pos,
                needed: n - remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u1(&mut self) -> Result<u8, ClassFormatError> {
        Ok(self.bytes(1)?[0])
    }

    fn u2(&mut self) -> Result<u16, ClassFormatError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u4(&mut self) -> Result<u32, ClassFormatError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn put_u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// One constant pool slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    Utf8(Vec<u8>),
    Class(u16),
    /// Any other tag, payload kept verbatim.
    Other { tag: u8, data: Vec<u8> },
    /// Slot 0 and the upper half of `Long`/`Double` entries.
    Unusable,
}

fn fixed_payload_size(tag: u8) -> Option<usize> {
    match tag {
        3 | 4 => Some(4),
        5 | 6 => Some(8),
        8 => Some(2),
        9..=12 => Some(4),
        15 => Some(3),
        16 => Some(2),
        17 | 18 => Some(4),
        19 | 20 => Some(2),
        _ => None,
    }
}

/// Decodes `CONSTANT_Utf8` payloads: NUL is `C0 80` and supplementary
/// characters are surrogate pairs of 3-byte sequences. Lone surrogates become
/// U+FFFD.
fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i];
        let continuation = |k: usize| bytes.get(i + k).copied().filter(|b| b & 0xC0 == 0x80);
        let (unit, width) = match b0 {
            0x01..=0x7F => (u16::from(b0), 1),
            0xC0..=0xDF => {
                let b1 = continuation(1)?;
                ((u16::from(b0 & 0x1F) << 6) | u16::from(b1 & 0x3F), 2)
            }
            0xE0..=0xEF => {
                let (b1, b2) = (continuation(1)?, continuation(2)?);
                (
                    (u16::from(b0 & 0x0F) << 12)
                        | (u16::from(b1 & 0x3F) << 6)
                        | u16::from(b2 & 0x3F),
                    3,
                )
            }
            _ => return None,
        };
        units.push(unit);
        i += width;
    }
    Some(
        char::decode_utf16(units)
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect(),
    )
}

fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }
}

impl ConstantPool {
    fn parse(r: &mut Reader<'_>) -> Result<Self, ClassFormatError> {
        let count = r.u2()?;
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);

        let mut index = 1u16;
        while index < count {
            let tag = r.u1()?;
            let entry = match tag {
                TAG_UTF8 => {
                    let len = r.u2()? as usize;
                    Constant::Utf8(r.bytes(len)?.to_vec())
                }
                TAG_CLASS => Constant::Class(r.u2()?),
                _ => {
                    let size = fixed_payload_size(tag)
                        .ok_or(ClassFormatError::UnknownConstant { tag, index })?;
                    Constant::Other {
                        tag,
                        data: r.bytes(size)?.to_vec(),
                    }
                }
            };
            entries.push(entry);
            if tag == TAG_LONG || tag == TAG_DOUBLE {
                if index + 1 >= count {
                    return Err(ClassFormatError::WideConstantAtEnd(index));
                }
                entries.push(Constant::Unusable);
                index = index.saturating_add(2);
            } else {
                index += 1;
            }
        }
        Ok(Self { entries })
    }

    fn write(&self, out: &mut Vec<u8>) {
        put_u2(out, self.entries.len() as u16);
        for entry in self.entries.iter().skip(1) {
            match entry {
                Constant::Utf8(bytes) => {
                    out.push(TAG_UTF8);
                    put_u2(out, bytes.len() as u16);
                    out.extend_from_slice(bytes);
                }
                Constant::Class(name_index) => {
                    out.push(TAG_CLASS);
                    put_u2(out, *name_index);
                }
                Constant::Other { tag, data } => {
                    out.push(*tag);
                    out.extend_from_slice(data);
                }
                Constant::Unusable => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.entries.get(index as usize)
    }

    /// Appends an entry and returns its index.
    pub fn push(&mut self, constant: Constant) -> u16 {
        let index = self.entries.len() as u16;
        let wide = matches!(
            constant,
            Constant::Other { tag, .. } if tag == TAG_LONG || tag == TAG_DOUBLE
        );
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        index
    }

    pub fn utf8(&self, index: u16) -> Result<String, ClassFormatError> {
        match self.get(index) {
            Some(Constant::Utf8(bytes)) => {
                decode_modified_utf8(bytes).ok_or(ClassFormatError::BadUtf8(index))
            }
            _ => Err(ClassFormatError::BadConstantRef(index, "Utf8")),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<String, ClassFormatError> {
        match self.get(index) {
            Some(Constant::Class(name_index)) => self.utf8(*name_index),
            _ => Err(ClassFormatError::BadConstantRef(index, "Class")),
        }
    }

    fn intern_utf8(&mut self, value: &str) -> u16 {
        let encoded = encode_modified_utf8(value);
        let existing = self
            .entries
            .iter()
            .position(|c| matches!(c, Constant::Utf8(b) if *b == encoded));
        match existing {
            Some(i) => i as u16,
            None => self.push(Constant::Utf8(encoded)),
        }
    }

    fn intern_class(&mut self, name: &str) -> u16 {
        let name_index = self.intern_utf8(name);
        let existing = self
            .entries
            .iter()
            .position(|c| matches!(c, Constant::Class(i) if *i == name_index));
        match existing {
            Some(i) => i as u16,
            None => self.push(Constant::Class(name_index)),
        }
    }
}

/// The leading part of a class file: everything up to the interface table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassHeader {
    pub minor_version: u16,
    pub major_version: u16,
    pub access: AccessFlags,
    /// Internal (slash separated) name.
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
}

struct Prefix {
    minor_version: u16,
    major_version: u16,
    pool: ConstantPool,
    access: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
}

fn read_prefix(r: &mut Reader<'_>) -> Result<Prefix, ClassFormatError> {
    let magic = r.u4()?;
    if magic != MAGIC {
        return Err(ClassFormatError::BadMagic(magic));
    }
    let minor_version = r.u2()?;
    let major_version = r.u2()?;
    let pool = ConstantPool::parse(r)?;
    let access = r.u2()?;
    let this_class = r.u2()?;
    let super_class = r.u2()?;
    let count = r.u2()?;
    let mut interfaces = Vec::with_capacity(count as usize);
    for _ in 0..count {
        interfaces.push(r.u2()?);
    }
    Ok(Prefix {
        minor_version,
        major_version,
        pool,
        access,
        this_class,
        super_class,
        interfaces,
    })
}

fn header_from_prefix(p: &Prefix) -> Result<ClassHeader, ClassFormatError> {
    let super_name = match p.super_class {
        0 => None,
        i => Some(p.pool.class_name(i)?),
    };
    let interfaces = p
        .interfaces
        .iter()
        .map(|i| p.pool.class_name(*i))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ClassHeader {
        minor_version: p.minor_version,
        major_version: p.major_version,
        access: AccessFlags::from_bits_retain(p.access),
        name: p.pool.class_name(p.this_class)?,
        super_name,
        interfaces,
    })
}

impl ClassHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFormatError> {
        let mut r = Reader::new(bytes);
        let prefix = read_prefix(&mut r)?;
        header_from_prefix(&prefix)
    }

    pub fn is_interface(&self) -> bool {
        self.access.contains(AccessFlags::INTERFACE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

/// A field or a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub access: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

fn read_attributes(r: &mut Reader<'_>) -> Result<Vec<Attribute>, ClassFormatError> {
    let count = r.u2()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = r.u2()?;
        let len = r.u4()? as usize;
        out.push(Attribute {
            name_index,
            info: r.bytes(len)?.to_vec(),
        });
    }
    Ok(out)
}

fn write_attributes(out: &mut Vec<u8>, attributes: &[Attribute]) {
    put_u2(out, attributes.len() as u16);
    for a in attributes {
        put_u2(out, a.name_index);
        put_u4(out, a.info.len() as u32);
        out.extend_from_slice(&a.info);
    }
}

fn read_members(r: &mut Reader<'_>) -> Result<Vec<Member>, ClassFormatError> {
    let count = r.u2()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access = r.u2()?;
        let name_index = r.u2()?;
        let descriptor_index = r.u2()?;
        let attributes = read_attributes(r)?;
        out.push(Member {
            access,
            name_index,
            descriptor_index,
            attributes,
        });
    }
    Ok(out)
}

fn write_members(out: &mut Vec<u8>, members: &[Member]) {
    put_u2(out, members.len() as u16);
    for m in members {
        put_u2(out, m.access);
        put_u2(out, m.name_index);
        put_u2(out, m.descriptor_index);
        write_attributes(out, &m.attributes);
    }
}

/// Full structural model of a class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub pool: ConstantPool,
    pub access: AccessFlags,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<Member>,
    pub methods: Vec<Member>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFormatError> {
        let mut r = Reader::new(bytes);
        let prefix = read_prefix(&mut r)?;
        let fields = read_members(&mut r)?;
        let methods = read_members(&mut r)?;
        let attributes = read_attributes(&mut r)?;
        if r.remaining() > 0 {
            return Err(ClassFormatError::TrailingBytes(r.remaining()));
        }
        Ok(Self {
            minor_version: prefix.minor_version,
            major_version: prefix.major_version,
            pool: prefix.pool,
            access: AccessFlags::from_bits_retain(prefix.access),
            this_class: prefix.this_class,
            super_class: prefix.super_class,
            interfaces: prefix.interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        put_u4(&mut out, MAGIC);
        put_u2(&mut out, self.minor_version);
        put_u2(&mut out, self.major_version);
        self.pool.write(&mut out);
        put_u2(&mut out, self.access.bits());
        put_u2(&mut out, self.this_class);
        put_u2(&mut out, self.super_class);
        put_u2(&mut out, self.interfaces.len() as u16);
        for i in &self.interfaces {
            put_u2(&mut out, *i);
        }
        write_members(&mut out, &self.fields);
        write_members(&mut out, &self.methods);
        write_attributes(&mut out, &self.attributes);
        out
    }

    /// Internal name of this class.
    pub fn name(&self) -> Result<String, ClassFormatError> {
        self.pool.class_name(self.this_class)
    }

    pub fn method_names(&self) -> Result<Vec<String>, ClassFormatError> {
        self.methods
            .iter()
            .map(|m| self.pool.utf8(m.name_index))
            .collect()
    }

    /// Drops every method called `name`, whatever its descriptor. Returns how
    /// many were removed. Constant pool entries they referenced stay behind.
    pub fn remove_methods(&mut self, name: &str) -> Result<usize, ClassFormatError> {
        let names = self.method_names()?;
        let before = self.methods.len();
        let mut names = names.into_iter();
        self.methods
            .retain(|_| names.next().is_none_or(|n| n != name));
        Ok(before - self.methods.len())
    }
}

/// Builds minimal class files: a header, optional methods without code.
#[derive(Debug, Clone)]
pub struct ClassFileBuilder {
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    access: AccessFlags,
    methods: Vec<(String, String)>,
    major_version: u16,
}

impl ClassFileBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: internal_name(name),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            access: AccessFlags::PUBLIC | AccessFlags::SUPER,
            methods: Vec::new(),
            major_version: 52,
        }
    }

    pub fn interface(mut self) -> Self {
        self.access = AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
        self
    }

    pub fn super_class(mut self, name: Option<&str>) -> Self {
        self.super_name = name.map(internal_name);
        self
    }

    pub fn implements(mut self, name: &str) -> Self {
        self.interfaces.push(internal_name(name));
        self
    }

    pub fn access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    /// Adds a `public native` method, which needs no `Code` attribute.
    pub fn method(mut self, name: &str, descriptor: &str) -> Self {
        self.methods.push((name.to_string(), descriptor.to_string()));
        self
    }

    pub fn build_class_file(&self) -> ClassFile {
        let mut pool = ConstantPool::default();
        let this_class = pool.intern_class(&self.name);
        let super_class = self
            .super_name
            .as_deref()
            .map(|s| pool.intern_class(s))
            .unwrap_or(0);
        let interfaces = self
            .interfaces
            .iter()
            .map(|i| pool.intern_class(i))
            .collect();
        let methods = self
            .methods
            .iter()
            .map(|(name, desc)| Member {
                access: METHOD_PUBLIC_NATIVE,
                name_index: pool.intern_utf8(name),
                descriptor_index: pool.intern_utf8(desc),
                attributes: Vec::new(),
            })
            .collect();
        ClassFile {
            minor_version: 0,
            major_version: self.major_version,
            pool,
            access: self.access,
            this_class,
            super_class,
            interfaces,
            fields: Vec::new(),
            methods,
            attributes: Vec::new(),
        }
    }

    pub fn build(&self) -> Vec<u8> {
        self.build_class_file().to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_reads_names_and_flags() {
        let bytes = ClassFileBuilder::new("com.x.Foo")
            .implements("java.io.Serializable")
            .implements("java/lang/Runnable")
            .build();

        let header = ClassHeader::parse(&bytes).unwrap();
        assert_eq!(header.name, "com/x/Foo");
        assert_eq!(header.super_name.as_deref(), Some("java/lang/Object"));
        assert_eq!(header.interfaces, vec!["java/io/Serializable", "java/lang/Runnable"]);
        assert!(!header.is_interface());
        assert_eq!(header.major_version, 52);
    }

    #[test]
    fn root_type_has_no_super() {
        let bytes = ClassFileBuilder::new("java/lang/Object")
            .super_class(None)
            .build();
        let header = ClassHeader::parse(&bytes).unwrap();
        assert_eq!(header.super_name, None);
    }

    #[test]
    fn full_parse_writes_back_identical_bytes() {
        let bytes = ClassFileBuilder::new("a/B")
            .method("bar", "()V")
            .method("baz", "(I)I")
            .build();
        let cf = ClassFile::parse(&bytes).unwrap();
        assert_eq!(cf.to_bytes(), bytes);
        assert_eq!(cf.method_names().unwrap(), vec!["bar", "baz"]);
    }

    #[test]
    fn wide_constants_take_two_slots() {
        let mut cf = ClassFileBuilder::new("a/B").build_class_file();
        let long_index = cf.pool.push(Constant::Other {
            tag: TAG_LONG,
            data: 7u64.to_be_bytes().to_vec(),
        });
        let after = cf.pool.push(Constant::Utf8(b"after".to_vec()));
        assert_eq!(after, long_index + 2);

        let reparsed = ClassFile::parse(&cf.to_bytes()).unwrap();
        assert_eq!(reparsed.pool.utf8(after).unwrap(), "after");
        assert_eq!(reparsed.name().unwrap(), "a/B");
    }

    #[test]
    fn wide_constant_in_last_slot_is_rejected() {
        let mut cf = ClassFileBuilder::new("a/B").build_class_file();
        let long_index = cf.pool.push(Constant::Other {
            tag: TAG_LONG,
            data: 7u64.to_be_bytes().to_vec(),
        });
        let mut bytes = cf.to_bytes();
        // Constant pool count sits right after magic and version.
        let count = long_index + 1;
        bytes[8..10].copy_from_slice(&count.to_be_bytes());
        assert_eq!(
            ClassHeader::parse(&bytes),
            Err(ClassFormatError::WideConstantAtEnd(long_index))
        );
    }

    #[test]
    fn names_use_modified_utf8() {
        assert_eq!(encode_modified_utf8("a\0b"), vec![b'a', 0xC0, 0x80, b'b']);
        assert_eq!(
            encode_modified_utf8("\u{1F600}"),
            vec![0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]
        );
        assert_eq!(
            decode_modified_utf8(&[0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]).as_deref(),
            Some("\u{1F600}")
        );
        assert_eq!(decode_modified_utf8(&[0x00]), None);
        assert_eq!(decode_modified_utf8(&[0xC3]), None);

        let name = "p/Caf\u{E9}\u{1F600}\0Tail";
        let bytes = ClassFileBuilder::new(name).method("m\u{1F600}", "()V").build();
        let header = ClassHeader::parse(&bytes).unwrap();
        assert_eq!(header.name, name);
        let cf = ClassFile::parse(&bytes).unwrap();
        assert_eq!(cf.to_bytes(), bytes);
        assert_eq!(cf.method_names().unwrap(), vec!["m\u{1F600}"]);
    }

    #[test]
    fn builder_access_overrides_flags() {
        let bytes = ClassFileBuilder::new("a/Final")
            .access(AccessFlags::PUBLIC | AccessFlags::FINAL)
            .build();
        let header = ClassHeader::parse(&bytes).unwrap();
        assert!(header.access.contains(AccessFlags::FINAL));
        assert!(!header.access.contains(AccessFlags::SUPER));
    }

    #[test]
    fn remove_methods_drops_all_overloads() {
        let bytes = ClassFileBuilder::new("a/B")
            .method("bar", "()V")
            .method("keep", "()V")
            .method("bar", "(I)V")
            .build();
        let mut cf = ClassFile::parse(&bytes).unwrap();
        assert_eq!(cf.remove_methods("bar").unwrap(), 2);
        assert_eq!(cf.method_names().unwrap(), vec!["keep"]);
        assert_eq!(cf.remove_methods("bar").unwrap(), 0);

        let reparsed = ClassFile::parse(&cf.to_bytes()).unwrap();
        assert_eq!(reparsed.method_names().unwrap(), vec!["keep"]);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        assert_eq!(
            ClassHeader::parse(&[0, 1, 2, 3, 0, 0]),
            Err(ClassFormatError::BadMagic(0x0001_0203))
        );

        let bytes = ClassFileBuilder::new("a/B").build();
        let err = ClassHeader::parse(&bytes[..12]).unwrap_err();
        assert!(matches!(err, ClassFormatError::Truncated { .. }));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = ClassFileBuilder::new("a/B").build();
        bytes.push(0);
        assert_eq!(
            ClassFile::parse(&bytes),
            Err(ClassFormatError::TrailingBytes(1))
        );
        assert!(ClassHeader::parse(&bytes).is_ok());
    }
}
