use serde::Serialize;

/// Splits `count` rows into pages of `per_page`. There is always at least one page.
#[derive(Debug, Clone, Copy)]
pub struct Paginator {
    count: i64,
    per_page: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub number: i64,
    pub num_pages: i64,
    pub count: i64,
    pub per_page: i64,
    /// 1-based index of the first row on this page; 0 when there are no rows.
    pub start_index: i64,
    pub end_index: i64,
    pub has_previous: bool,
    pub has_next: bool,
}

impl Paginator {
    pub fn new(count: i64, per_page: usize) -> Self {
        Self {
            count: count.max(0),
            per_page: (per_page as i64).max(1),
        }
    }

    pub fn num_pages(&self) -> i64 {
        ((self.count + self.per_page - 1) / self.per_page).max(1)
    }

    /// Resolves a requested page leniently: anything unparsable is page 1,
    /// anything out of range is the last page.
    pub fn get_page(&self, requested: &str) -> PageInfo {
        let num_pages = self.num_pages();
        let number = match requested.trim().parse::<i64>() {
            Ok(n) if (1..=num_pages).contains(&n) => n,
            Ok(_) => num_pages,
            Err(_) => 1,
        };

        let (start_index, end_index) = if self.count == 0 {
            (0, 0)
        } else {
            let start = (number - 1) * self.per_page + 1;
            (start, (number * self.per_page).min(self.count))
        };

        PageInfo {
            number,
            num_pages,
            count: self.count,
            per_page: self.per_page,
            start_index,
            end_index,
            has_previous: number > 1,
            has_next: number < num_pages,
        }
    }
}

impl PageInfo {
    pub fn offset(&self) -> i64 {
        (self.number - 1) * self.per_page
    }

    /// Display number of the first row when the newest row is numbered `count`.
    pub fn first_row_number(&self) -> i64 {
        self.count - self.start_index + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_has_one_page() {
        let page = Paginator::new(0, 30).get_page("1");
        assert_eq!(page.num_pages, 1);
        assert_eq!(page.start_index, 0);
        assert!(!page.has_next);
        assert!(!page.has_previous);
    }

    #[test]
    fn test_page_bounds() {
        let paginator = Paginator::new(65, 30);
        assert_eq!(paginator.num_pages(), 3);

        let page = paginator.get_page("2");
        assert_eq!(page.start_index, 31);
        assert_eq!(page.end_index, 60);
        assert_eq!(page.offset(), 30);
        assert!(page.has_next && page.has_previous);

        let last = paginator.get_page("3");
        assert_eq!(last.end_index, 65);
        assert!(!last.has_next);
    }

    #[test]
    fn test_lenient_page_numbers() {
        let paginator = Paginator::new(65, 30);
        assert_eq!(paginator.get_page("abc").number, 1);
        assert_eq!(paginator.get_page("").number, 1);
        assert_eq!(paginator.get_page("99").number, 3);
        assert_eq!(paginator.get_page("0").number, 3);
    }

    #[test]
    fn test_descending_row_numbers() {
        let paginator = Paginator::new(65, 30);
        assert_eq!(paginator.get_page("1").first_row_number(), 65);
        assert_eq!(paginator.get_page("2").first_row_number(), 35);
        assert_eq!(paginator.get_page("3").first_row_number(), 5);
    }
}
