//! Content defined chunking with a 64-bit gear rolling hash.
//!
//! For every input byte `b` the hash advances as `h = (h << 1) ^ GEAR[b]`,
//! so only the last 64 bytes influence a boundary decision and an edit
//! re-syncs with the old chunk sequence after roughly one average chunk.
//!
//! The gear table is part of the on-disk contract: chunk fingerprints are
//! only stable across versions as long as the table constants never change.

/// Never cut before this many bytes.
pub const CHUNK_SIZE_MIN: usize = 32 * 1024;
/// Expected chunk size for random input.
pub const CHUNK_SIZE_AVG: usize = 64 * 1024;
/// Hard upper bound; a cut is forced here.
pub const CHUNK_SIZE_MAX: usize = 512 * 1024;
/// 14 bit boundary mask.
const BREAK_MASK: u64 = 0x3fff;

// Generated once with splitmix64 seeded 0x4442_4b50 and frozen.
// Do not regenerate: changing any constant breaks cross-version dedup.
const GEAR: [u64; 256] = [
    0x891dd648adcfacb5, 0x44af8532d804c885, 0x04c52630257dd0e8, 0x9cc61554d058844d,
    0x533c01780bfc0960, 0xeb4f41fc8f43d5e9, 0x04e72424d1662163, 0x706664fb776ea320,
    0xcfe01e4ff610391c, 0xbbb69affaa94e443, 0x832130c01d89edad, 0xadf6b1d8b83a2619,
    0xa4fc191b0e802c1f, 0xb0fa2ddf5f6dd5a0, 0x6b8f2241fc7fd428, 0x4dab7d23f47effce,
    0x49a212c41e2061b9, 0x3921ac9c6a9241b5, 0x6ca9d0c5c34a7267, 0x3fbf55d79fd568e7,
    0x82103d48218b16fa, 0xda4bd9e338d52897, 0xbab6c77a4eb0fb81, 0xf5c4c495dfe907eb,
    0x1b9479b03b8e1c8e, 0x372af4ff1698185e, 0x24ed1f43e5f47b22, 0x1514d6869c4fe05f,
    0xbc8a4ea83eea2d6b, 0x90e6d81ba07b5b8f, 0xdb905e3f4801def8, 0x3716666aaf4b6c65,
    0xa8de247feb1538c7, 0x129263df73825d0e, 0xdd2c90ce341140bf, 0xaf804aa5d5d97c4f,
    0x52fd5e4bda1536ff, 0x86d06d226ab63d56, 0x56d318190f0afac7, 0x1e377689f53d539a,
    0x439944e5f71301de, 0xc55d3e8aa7c73649, 0xe6ae30e34489d6d4, 0x25debc4b15fd7b86,
    0x9e6a4c6038e291d7, 0x27813b02032fed62, 0x8b191be7abec99a1, 0x01a9a4a1609b4296,
    0x3f7814c4cc550577, 0x4df2c4dd7b92bbd0, 0x1ca40b4028e47dc4, 0xbb3f4197c854c11e,
    0x51d03eb15d9fb048, 0x9501bd5e8ba227cd, 0x39dd12011933f812, 0x45654596f7d2eb24,
    0x613b2446562002f7, 0x065368c9661adf5e, 0x5b49eb709aa91610, 0x5633290d0181267f,
    0x5d8e4b4244a8692b, 0x49eea3b530d43a7c, 0x1e4e1d12e111638d, 0x8f9007368a7ad77b,
    0xf261fd0029a5e8d5, 0x6002e3ce9821a698, 0x78ae9dac860bc4c0, 0x8817707ae3791fd4,
    0xfa2d3cf4c670f479, 0x007b371794652e8d, 0x1d441e30780679bf, 0xc3f7ed8b15d5e37b,
    0x5ac7a321b80d0137, 0x44f0fa2a9af63fb7, 0x57adeac5f50b23c7, 0x663bc6562e88f57e,
    0x2d7bac2d85146778, 0x356e5e18d768f41c, 0x9bea25a9b54ae60a, 0x8f15e3f4fea66bb9,
    0x8834e3ae587f2719, 0xc9667cda9af91595, 0xd29f59dfd6edab67, 0xbec0958e4ee545b1,
    0x5533d38b31eb8b36, 0xda66c4bc2cd07558, 0x07a28e45483eb880, 0xedbedfc0dc6feff5,
    0x2817741db40c4738, 0xaf95cda4c96c2faa, 0xed6ff024497357e3, 0x8c21cac6dab5e359,
    0x29cd6e929a6a4063, 0x8c64c789ca932933, 0xa17fd62f0460caf2, 0x79dd4d1ef836a4be,
    0x1a983e7e39830b8c, 0x139ecdd6a64f533a, 0x96ccbb7d8953dd70, 0x11bb07cf319df703,
    0x009ae3865b742bba, 0xc83cb40129cef6bf, 0xd05f26f6241f2ae2, 0x010c15ee42a66d52,
    0x6e6e95b5d8f61cb2, 0xb2b44e4ec3a97a0f, 0x0494ddd0ca99cd7a, 0x39d806a897a358ac,
    0x9d5d0d570d347b8e, 0x17a4692a1cd1cdc4, 0xe13eb8474870300f, 0x2c1f50bd13620b03,
    0xb38ed7aba0153a86, 0xd69807c3313996be, 0x65f867a84b28c8e4, 0xdbb800c22f4cb3c6,
    0x58f7ac2c0e70dd82, 0x0160b37fd4815d55, 0x15dc5355ba7539b4, 0xb4c4b27bcc65ba90,
    0x103a1adad5cadeba, 0xd0bc6721b3a7d6c9, 0x8916a8fd90559db9, 0x95cc479d5d6b5bb9,
    0xe0b4c9ab97d58caf, 0x3d017e8d4e800220, 0xe6efc1f9cf3e05e7, 0xb314842558f0f7a6,
    0xb1037235c548dfde, 0x7599301e406f0c9c, 0xa2a95191c75d274e, 0x5c507a18c726c610,
    0xd7839b577f4a4b62, 0xe144222629027d87, 0xf639e13ca66ee37c, 0x8e1f4c3f1f7c863a,
    0xa4de0634017ea821, 0xf58e60f9c2211e67, 0xa48311f498cc06bc, 0xe85429335f4d4ebd,
    0x5d295b88c6dd1e0b, 0x1cb5f871a3ad19a6, 0xd4df3abe2757fa6f, 0x6cd989f39a6ae2dc,
    0xef17e8027cee703a, 0xc43308c7f2b711b9, 0xb2a000287d495ccf, 0x2d090e3abd74bb80,
    0x2312c3876b18374f, 0xe8f3321469a0e705, 0x47678d89946bd1a4, 0xbef894ea7f9ddc4f,
    0x6aa43226a24b09bb, 0x282b4725638950d4, 0x79713bb8a0618903, 0x395272b6c3c1d4ef,
    0xd0f6a07518d69dc8, 0xaa3b9b3ab5494527, 0x1e676dccfe09809c, 0x998a8a89750741fe,
    0xe8c36b87b9954daa, 0x69e03d186ed29cfd, 0x16297652a6d4a13c, 0xbc3dcbfed65cdb78,
    0x360b2aec4345504a, 0xf7cb36fc06c94273, 0x914e87146cb48305, 0x065b648319aa3a3f,
    0x5e24fef286b79d87, 0xab7534640e8acb93, 0x8aa786860972743d, 0xa21a9f2223139e3e,
    0x1b3fe602ea2a0f9a, 0x280bd482789754aa, 0x79b1483f202dda3c, 0x6b4decc7a2f96c9f,
    0x5f0ece6debe9fc73, 0x1e19adbb24e835f8, 0x412801e3b50ea6ab, 0x79a832efa37081d3,
    0xc36c407dd969d8a2, 0x8d86c713c7c69a19, 0xf542205898b9afa9, 0x3f9de247ca8014a2,
    0xc6612ceeaacb3c6b, 0x8847ab81738e7dde, 0x631674c181969870, 0xbcca0a91e4a341a0,
    0x2b12309bc18d10a3, 0x80bd91b5a360808b, 0xfe077602e58f3bf9, 0xcbbc29decf9b6148,
    0xce3eab0844af966d, 0xbb98d2d8855b9540, 0xf2d22ea73e9bf3f3, 0x489dda0ddd1dca4f,
    0x76e6fca6c0fda48a, 0xa50fea7b58e06990, 0x04301bb63c4b0ecd, 0x570b1a02c60827c3,
    0x44ebe263aaf668a9, 0xc7d8bfc2877e1f7a, 0xfa9346fccea59b7b, 0x5d83db85d779cb03,
    0xd4a2f2db51c4944a, 0xf4e9de6ac5b4ee15, 0x846015f8f9fe1ef9, 0x5debffbdcea090d8,
    0x781aebddb02ba522, 0x4ba35a3765a546c3, 0x5d4ec1f989d01d7b, 0x2242a198ce118620,
    0x2fdd7d5f42d936e3, 0x90b1413fc4b2949a, 0xab99e98941525e9d, 0xcb2095d1a2f3d89b,
    0x223a6d868cb78ed8, 0xfd05b5b9b1a9b6ba, 0x283bc775e2bc036e, 0x8c021696a3ab867b,
    0xb91e17a07aca9038, 0x70bf6402d8b26e48, 0x48d196e058aa39b6, 0x8718b2de461e93cb,
    0xd4d182cba6b6e793, 0x40e0d7aad9502d3c, 0x37a3c2e62e4baa65, 0xf056f44e043bbae3,
    0x7f23e0359df851f3, 0xa5a1640e38996b52, 0x62274b5876b581e9, 0x9b9d62bebe4da398,
    0xd93219393a2384ce, 0xe60a645637857b15, 0xb19adcd3126d51f2, 0x51072ca25625bee5,
    0xcad73357cebb3a69, 0x5c732788a1eb97bb, 0x204bba579fdcaa71, 0x827e3e5835c9394b,
    0x3c4d83151a4b5b70, 0x02ee48c6923995a2, 0x4df7689153bc3356, 0xf8a8dffe67ed2dec,
    0x740efac5f2364249, 0xa67c04b7b8e78fdb, 0x50c89a769f440650, 0x4b6a6ed5e476265a,
    0x5ae20a90ac8a1c77, 0x88a0581ce858f819, 0x91803b66fe099284, 0x756f7e75d7ffbe24,
    0x7eeb90597a26ab9f, 0x395fe8bb5fefd079, 0xe1834dc685822b0d, 0x1c6e6c76cbd40337,
];

/// Incremental boundary scanner.
///
/// Feed arbitrary slices with [`scan`](Chunker::scan); a nonzero return is
/// the offset of the next chunk boundary within the given slice. State
/// resets at every boundary, so the same input always yields the same
/// chunk sequence no matter how it is sliced up between calls.
pub struct Chunker {
    h: u64,
    chunk_size: usize,
}

impl Chunker {
    pub fn new() -> Self {
        Self { h: 0, chunk_size: 0 }
    }

    /// Scans the data for a chunk border. Returns 0 if none was found
    /// (and the function should be called with more data later on), or
    /// the position of a border.
    pub fn scan(&mut self, data: &[u8]) -> usize {
        let mut pos = 0;

        while pos < data.len() {
            self.h = (self.h << 1) ^ GEAR[data[pos] as usize];
            self.chunk_size += 1;
            pos += 1;

            let boundary = self.chunk_size >= CHUNK_SIZE_MIN && (self.h & BREAK_MASK) == 0;
            if boundary || self.chunk_size >= CHUNK_SIZE_MAX {
                self.h = 0;
                self.chunk_size = 0;
                return pos;
            }
        }

        0
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull based splitter over any reader.
///
/// Yields non-empty chunks whose concatenation equals the input; every
/// chunk except the last is between `CHUNK_SIZE_MIN` and `CHUNK_SIZE_MAX`
/// bytes long.
pub struct ChunkSplitter<R> {
    input: R,
    chunker: Chunker,
    buffer: Vec<u8>,
    scan_pos: usize,
    eof: bool,
}

impl<R: std::io::Read> ChunkSplitter<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            chunker: Chunker::new(),
            buffer: Vec::new(),
            scan_pos: 0,
            eof: false,
        }
    }
}

impl<R: std::io::Read> Iterator for ChunkSplitter<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut read_buf = [0u8; 64 * 1024];
        loop {
            if self.scan_pos < self.buffer.len() {
                let boundary = self.chunker.scan(&self.buffer[self.scan_pos..]);
                if boundary == 0 {
                    self.scan_pos = self.buffer.len();
                } else {
                    let chunk_size = self.scan_pos + boundary;
                    let rest = self.buffer.split_off(chunk_size);
                    let chunk = std::mem::replace(&mut self.buffer, rest);
                    self.scan_pos = 0;
                    return Some(Ok(chunk));
                }
            }

            if self.eof {
                if self.buffer.is_empty() {
                    return None;
                }
                self.scan_pos = 0;
                return Some(Ok(std::mem::take(&mut self.buffer)));
            }

            match self.input.read(&mut read_buf) {
                Ok(0) => self.eof = true,
                Ok(count) => self.buffer.extend_from_slice(&read_buf[..count]),
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.eof = true;
                    self.buffer.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}
