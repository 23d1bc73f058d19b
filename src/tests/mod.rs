mod pool_tests;
mod xml_cursor_tests;
