/// Element width of a result buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementWidth {
    U8,
    U16,
    U32,
}

impl ElementWidth {
    /// Width used when an unsupported element size is requested.
    pub const DEFAULT: ElementWidth = ElementWidth::U16;

    /// Element width for an element size in bytes, if supported.
    pub fn from_bytes(size: usize) -> Option<Self> {
        match size {
            1 => Some(ElementWidth::U8),
            2 => Some(ElementWidth::U16),
            4 => Some(ElementWidth::U32),
            _ => None,
        }
    }

    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            ElementWidth::U8 => 1,
            ElementWidth::U16 => 2,
            ElementWidth::U32 => 4,
        }
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }
}

/// The growing, precision-increasing destination buffer of an attribute stream.
///
/// It is a plain owned value: while a refinement level is being decoded it lives on the decode worker side, and only there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultBuffer {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl ResultBuffer {
    /// Create a zeroed buffer of `len` elements.
    pub fn zeroed(width: ElementWidth, len: usize) -> Self {
        match width {
            ElementWidth::U8 => ResultBuffer::U8(vec![0; len]),
            ElementWidth::U16 => ResultBuffer::U16(vec![0; len]),
            ElementWidth::U32 => ResultBuffer::U32(vec![0; len]),
        }
    }

    /// Create a zeroed buffer of `len` elements of `size` bytes each.
    ///
    /// Unsupported sizes are logged and degrade to [`ElementWidth::DEFAULT`].
    pub fn with_element_size(size: usize, len: usize) -> Self {
        let width = ElementWidth::from_bytes(size).unwrap_or_else(|| {
            tracing::error!(
                "Unsupported result buffer element size: {size} byte(s), falling back to {} byte(s)",
                ElementWidth::DEFAULT.bytes()
            );
            ElementWidth::DEFAULT
        });

        Self::zeroed(width, len)
    }

    pub fn width(&self) -> ElementWidth {
        match self {
            ResultBuffer::U8(_) => ElementWidth::U8,
            ResultBuffer::U16(_) => ElementWidth::U16,
            ResultBuffer::U32(_) => ElementWidth::U32,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed view over the current contents.
    pub fn view(&self) -> TypedView<'_> {
        match self {
            ResultBuffer::U8(data) => TypedView::U8(data),
            ResultBuffer::U16(data) => TypedView::U16(data),
            ResultBuffer::U32(data) => TypedView::U32(data),
        }
    }
}

impl From<Vec<u8>> for ResultBuffer {
    fn from(data: Vec<u8>) -> Self {
        ResultBuffer::U8(data)
    }
}

impl From<Vec<u16>> for ResultBuffer {
    fn from(data: Vec<u16>) -> Self {
        ResultBuffer::U16(data)
    }
}

impl From<Vec<u32>> for ResultBuffer {
    fn from(data: Vec<u32>) -> Self {
        ResultBuffer::U32(data)
    }
}

/// An unsigned integer view over a result buffer, handed to consumers each time a level has been merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedView<'a> {
    U8(&'a [u8]),
    U16(&'a [u16]),
    U32(&'a [u32]),
}

impl TypedView<'_> {
    pub fn len(&self) -> usize {
        match self {
            TypedView::U8(data) => data.len(),
            TypedView::U16(data) => data.len(),
            TypedView::U32(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`, widened.
    pub fn get(&self, index: usize) -> Option<u32> {
        match self {
            TypedView::U8(data) => data.get(index).copied().map(u32::from),
            TypedView::U16(data) => data.get(index).copied().map(u32::from),
            TypedView::U32(data) => data.get(index).copied(),
        }
    }

    /// Every element, widened.
    pub fn to_vec(&self) -> Vec<u32> {
        (0..self.len()).filter_map(|index| self.get(index)).collect()
    }
}
