//! Minimal PDF writer: one page per image, each image embedded as a JPEG
//! (`DCTDecode`) XObject filling its page.

use std::io::{Cursor, Write as _};
use std::path::Path;

use anyhow::Context as _;
use image::codecs::jpeg::{JpegDecoder, JpegEncoder};
use image::{ColorType, ImageDecoder as _, ImageFormat};

const REENCODE_JPEG_QUALITY: u8 = 92;

/// Page size and image transform for one image, in PDF user space
/// (1 image pixel = 1 pt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub page_width: u32,
    pub page_height: u32,
    /// `a b c d e f` operands of the `cm` operator.
    pub matrix: [i64; 6],
    pub rotated: bool,
}

/// Portrait images fill the page as-is. Landscape images are turned 90°
/// clockwise onto a portrait page so every page reads in the same direction.
pub fn placement(width: u32, height: u32) -> Placement {
    let (w, h) = (i64::from(width), i64::from(height));
    if width > height {
        Placement {
            page_width: height,
            page_height: width,
            matrix: [0, -w, h, 0, 0, w],
            rotated: true,
        }
    } else {
        Placement {
            page_width: width,
            page_height: height,
            matrix: [w, 0, 0, h, 0, 0],
            rotated: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PdfImage {
    pub width: u32,
    pub height: u32,
    color_space: &'static str,
    jpeg: Vec<u8>,
}

impl PdfImage {
    /// Accepts JPEG and PNG, sniffed from the content. RGB and grayscale JPEGs
    /// are embedded verbatim; anything else is re-encoded as RGB JPEG.
    pub fn from_bytes(bytes: Vec<u8>) -> anyhow::Result<Self> {
        let format = image::guess_format(&bytes).context("detect image format")?;
        match format {
            ImageFormat::Jpeg => {
                let ((width, height), color_type) = {
                    let decoder = JpegDecoder::new(Cursor::new(bytes.as_slice()))
                        .context("read jpeg header")?;
                    (decoder.dimensions(), decoder.color_type())
                };
                let color_space = match color_type {
                    ColorType::Rgb8 => Some("/DeviceRGB"),
                    ColorType::L8 => Some("/DeviceGray"),
                    _ => None,
                };
                match color_space {
                    Some(color_space) => Ok(Self {
                        width,
                        height,
                        color_space,
                        jpeg: bytes,
                    }),
                    None => Self::reencode(&bytes),
                }
            }
            ImageFormat::Png => Self::reencode(&bytes),
            other => anyhow::bail!("unsupported image format: {other:?} (expected jpeg or png)"),
        }
    }

    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read image: {}", path.display()))?;
        Self::from_bytes(bytes).with_context(|| format!("load image: {}", path.display()))
    }

    fn reencode(bytes: &[u8]) -> anyhow::Result<Self> {
        let decoded = image::load_from_memory(bytes).context("decode image")?;
        let rgb = decoded.to_rgb8();
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, REENCODE_JPEG_QUALITY)
            .encode_image(&rgb)
            .context("encode jpeg")?;
        Ok(Self {
            width: rgb.width(),
            height: rgb.height(),
            color_space: "/DeviceRGB",
            jpeg,
        })
    }
}

/// Builds a PDF with one page per image, in the given order.
pub fn render_pdf(images: &[PdfImage]) -> anyhow::Result<Vec<u8>> {
    if images.is_empty() {
        anyhow::bail!("no images to render");
    }

    // 1: catalog, 2: page tree, then page/content/image triples
    let object_count = 2 + 3 * images.len();
    let mut writer = PdfWriter::new(object_count);

    let kids = (0..images.len())
        .map(|i| format!("{} 0 R", page_object_id(i)))
        .collect::<Vec<_>>()
        .join(" ");
    writer.object(1, "<< /Type /Catalog /Pages 2 0 R >>")?;
    writer.object(
        2,
        &format!(
            "<< /Type /Pages /Kids [{kids}] /Count {} >>",
            images.len()
        ),
    )?;

    for (i, image) in images.iter().enumerate() {
        let page_id = page_object_id(i);
        let content_id = page_id + 1;
        let image_id = page_id + 2;
        let placement = placement(image.width, image.height);

        writer.object(
            page_id,
            &format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] \
                 /Resources << /XObject << /Im0 {image_id} 0 R >> >> \
                 /Contents {content_id} 0 R >>",
                placement.page_width, placement.page_height
            ),
        )?;

        let [a, b, c, d, e, f] = placement.matrix;
        let content = format!("q {a} {b} {c} {d} {e} {f} cm /Im0 Do Q\n");
        writer.stream_object(content_id, "", content.as_bytes())?;

        writer.stream_object(
            image_id,
            &format!(
                "/Type /XObject /Subtype /Image /Width {} /Height {} \
                 /ColorSpace {} /BitsPerComponent 8 /Filter /DCTDecode",
                image.width, image.height, image.color_space
            ),
            &image.jpeg,
        )?;
    }

    writer.finish(1)
}

/// Renders `cover` (if any) followed by `images` into `output_path`,
/// replacing it atomically.
pub fn render_pdf_file(
    cover: Option<&Path>,
    images: &[impl AsRef<Path>],
    output_path: &Path,
) -> anyhow::Result<()> {
    let loaded = cover
        .into_iter()
        .chain(images.iter().map(|path| path.as_ref()))
        .map(PdfImage::open)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let bytes = render_pdf(&loaded)?;

    let parent = output_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("pdf path has no parent: {}", output_path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create pdf dir: {}", parent.display()))?;
    let tmp_path = output_path.with_extension(format!("pdf.tmp.{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp_path, &bytes)
        .with_context(|| format!("write tmp pdf: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, output_path)
        .with_context(|| format!("rename tmp pdf: {}", output_path.display()))?;
    Ok(())
}

fn page_object_id(index: usize) -> usize {
    3 + 3 * index
}

struct PdfWriter {
    buf: Vec<u8>,
    offsets: Vec<Option<usize>>,
}

impl PdfWriter {
    fn new(object_count: usize) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");
        Self {
            buf,
            offsets: vec![None; object_count],
        }
    }

    fn begin(&mut self, id: usize) -> anyhow::Result<()> {
        let slot = self
            .offsets
            .get_mut(id - 1)
            .ok_or_else(|| anyhow::anyhow!("pdf object id out of range: {id}"))?;
        *slot = Some(self.buf.len());
        writeln!(self.buf, "{id} 0 obj")?;
        Ok(())
    }

    fn object(&mut self, id: usize, body: &str) -> anyhow::Result<()> {
        self.begin(id)?;
        write!(self.buf, "{body}\nendobj\n")?;
        Ok(())
    }

    fn stream_object(&mut self, id: usize, dict_entries: &str, data: &[u8]) -> anyhow::Result<()> {
        self.begin(id)?;
        let sep = if dict_entries.is_empty() { "" } else { " " };
        write!(self.buf, "<< {dict_entries}{sep}/Length {} >>\nstream\n", data.len())?;
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\nendstream\nendobj\n");
        Ok(())
    }

    fn finish(mut self, root_id: usize) -> anyhow::Result<Vec<u8>> {
        let xref_offset = self.buf.len();
        write!(self.buf, "xref\n0 {}\n0000000000 65535 f \n", self.offsets.len() + 1)?;
        for (i, offset) in self.offsets.iter().enumerate() {
            let offset = offset.ok_or_else(|| anyhow::anyhow!("pdf object {} not written", i + 1))?;
            write!(self.buf, "{offset:010} 00000 n \n")?;
        }
        write!(
            self.buf,
            "trailer\n<< /Size {} /Root {root_id} 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
            self.offsets.len() + 1
        )?;
        Ok(self.buf)
    }
}
